/// Upstream session seam for the metadata refresher
///
/// The refresher owns exactly one bootstrap session plus short-lived sessions
/// to individual group members. Both go through [`SessionFactory`] so the
/// whole cache can be driven by scripted replayer sessions in tests, while
/// production uses `mysql_async` against real servers.
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Opts, OptsBuilder, SslOpts, Value};

use super::MetadataError;

/// One resultset row; every column rendered as text, NULL as None.
pub type Row = Vec<Option<String>>;

/// A connected session to one server.
#[async_trait]
pub trait MetadataSession: Send {
    /// Run a query and return the full resultset.
    async fn query(&mut self, sql: &str) -> Result<Vec<Row>, MetadataError>;

    /// `host:port` this session is connected to.
    fn address(&self) -> &str;
}

/// Opens sessions on demand.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(
        &self,
        host: &str,
        port: u16,
    ) -> Result<Box<dyn MetadataSession>, MetadataError>;
}

/// TLS posture for the upstream session, mirroring the server-side ssl-mode
/// option set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslMode {
    Disabled,
    Preferred,
    Required,
    VerifyCa,
    VerifyIdentity,
}

impl SslMode {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "DISABLED" => Some(SslMode::Disabled),
            "PREFERRED" => Some(SslMode::Preferred),
            "REQUIRED" => Some(SslMode::Required),
            "VERIFY_CA" => Some(SslMode::VerifyCa),
            "VERIFY_IDENTITY" => Some(SslMode::VerifyIdentity),
            _ => None,
        }
    }
}

/// TLS options forwarded to the client library.
#[derive(Debug, Clone)]
pub struct SslConfig {
    pub mode: SslMode,
    pub ca: Option<String>,
    pub capath: Option<String>,
    pub crl: Option<String>,
    pub crlpath: Option<String>,
    pub cipher: Option<String>,
    pub tls_version: Option<String>,
}

impl Default for SslConfig {
    fn default() -> Self {
        Self {
            mode: SslMode::Preferred,
            ca: None,
            capath: None,
            crl: None,
            crlpath: None,
            cipher: None,
            tls_version: None,
        }
    }
}

/// Production factory: real MySQL sessions over `mysql_async`.
pub struct MySqlSessionFactory {
    user: String,
    password: String,
    connect_timeout: Duration,
    ssl: SslConfig,
}

impl MySqlSessionFactory {
    pub fn new(user: String, password: String, connect_timeout: Duration, ssl: SslConfig) -> Self {
        Self {
            user,
            password,
            connect_timeout,
            ssl,
        }
    }

    fn ssl_opts(&self) -> Option<SslOpts> {
        let mut opts = SslOpts::default();
        if let Some(ca) = &self.ssl.ca {
            opts = opts.with_root_certs(vec![PathBuf::from(ca).into()]);
        }
        match self.ssl.mode {
            SslMode::Disabled => None,
            // The client library cannot fall back to cleartext, so PREFERRED
            // behaves like REQUIRED here.
            SslMode::Preferred | SslMode::Required => Some(
                opts.with_danger_accept_invalid_certs(true)
                    .with_danger_skip_domain_validation(true),
            ),
            SslMode::VerifyCa => Some(opts.with_danger_skip_domain_validation(true)),
            SslMode::VerifyIdentity => Some(opts),
        }
    }
}

#[async_trait]
impl SessionFactory for MySqlSessionFactory {
    async fn connect(
        &self,
        host: &str,
        port: u16,
    ) -> Result<Box<dyn MetadataSession>, MetadataError> {
        // localhost in the metadata means "that host's loopback", which from
        // here is only reachable as an IP
        let host = if host == "localhost" { "127.0.0.1" } else { host };

        let builder = OptsBuilder::default()
            .ip_or_hostname(host)
            .tcp_port(port)
            .user(Some(self.user.clone()))
            .pass(Some(self.password.clone()))
            .prefer_socket(false)
            .ssl_opts(self.ssl_opts());

        let conn = tokio::time::timeout(self.connect_timeout, Conn::new(Opts::from(builder)))
            .await
            .map_err(|_| {
                MetadataError::Query(format!("timed out connecting to {}:{}", host, port))
            })?
            .map_err(|e| MetadataError::Query(e.to_string()))?;

        Ok(Box::new(MySqlSession {
            conn,
            address: format!("{}:{}", host, port),
        }))
    }
}

struct MySqlSession {
    conn: Conn,
    address: String,
}

fn value_to_string(value: Value) -> Option<String> {
    match value {
        Value::NULL => None,
        Value::Bytes(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Value::Int(v) => Some(v.to_string()),
        Value::UInt(v) => Some(v.to_string()),
        Value::Float(v) => Some(v.to_string()),
        Value::Double(v) => Some(v.to_string()),
        other => Some(format!("{:?}", other)),
    }
}

#[async_trait]
impl MetadataSession for MySqlSession {
    async fn query(&mut self, sql: &str) -> Result<Vec<Row>, MetadataError> {
        let rows: Vec<mysql_async::Row> = self
            .conn
            .query(sql)
            .await
            .map_err(|e| MetadataError::Query(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| row.unwrap().into_iter().map(value_to_string).collect())
            .collect())
    }

    fn address(&self) -> &str {
        &self.address
    }
}
