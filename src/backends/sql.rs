//! SQL administration of databases and roles

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, ServerName};
use tokio_postgres::config::SslMode;
use tokio_postgres::{Client, NoTls};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, info, trace};

use super::ProvisionedUser;
use crate::credentials::CredentialBundle;
use crate::crd::DatabaseOptions;
use crate::error::{Error, Result};

/// Admin-level SQL operations against one server
#[async_trait]
pub trait SqlAdmin: Send + Sync {
    async fn database_exists(&self, admin: &CredentialBundle, name: &str) -> Result<bool>;

    /// Create the database if missing; returns whether it was created
    async fn create_database(&self, admin: &CredentialBundle, name: &str, options: &DatabaseOptions) -> Result<bool>;

    /// Remove default PUBLIC access to the database
    async fn revoke_public_access(&self, admin: &CredentialBundle, name: &str) -> Result<()>;

    /// Enable an extension inside `database`
    async fn create_extension(&self, admin: &CredentialBundle, database: &str, extension: &str) -> Result<()>;

    async fn drop_database(&self, admin: &CredentialBundle, name: &str) -> Result<()>;

    /// Create a login role if missing and grant it the database; returns
    /// whether the role was created
    async fn create_or_update_user(
        &self,
        admin: &CredentialBundle,
        username: &str,
        password: &str,
        database: &str,
    ) -> Result<bool>;

    async fn drop_user(&self, admin: &CredentialBundle, username: &str) -> Result<()>;

    async fn set_password(&self, admin: &CredentialBundle, username: &str, password: &str) -> Result<()>;
}

/// Database and user provisioning shared by every backend
#[derive(Clone)]
pub struct SqlDatabases {
    sql: Arc<dyn SqlAdmin>,
}

impl SqlDatabases {
    pub fn new(sql: Arc<dyn SqlAdmin>) -> Self {
        Self { sql }
    }

    pub async fn exists(&self, admin: &CredentialBundle, name: &str) -> Result<bool> {
        self.sql.database_exists(admin, name).await
    }

    /// Create if missing, then harden and enable extensions on every call
    pub async fn provision(&self, admin: &CredentialBundle, name: &str, options: &DatabaseOptions) -> Result<()> {
        if self.sql.create_database(admin, name, options).await? {
            info!(database = %name, "Created database");
        }
        self.sql.revoke_public_access(admin, name).await?;
        for extension in &options.extensions {
            debug!(database = %name, extension = %extension, "Enabling extension");
            self.sql.create_extension(admin, name, extension).await?;
        }
        Ok(())
    }

    pub async fn drop(&self, admin: &CredentialBundle, name: &str) -> Result<()> {
        self.sql.drop_database(admin, name).await
    }

    pub async fn provision_user(
        &self,
        admin: &CredentialBundle,
        database: &str,
        username: &str,
        password: &str,
    ) -> Result<ProvisionedUser> {
        let newly_created = self
            .sql
            .create_or_update_user(admin, username, password, database)
            .await?;
        Ok(ProvisionedUser {
            newly_created,
            credentials: admin.for_user(username, password, database),
        })
    }

    pub async fn drop_user(&self, admin: &CredentialBundle, username: &str) -> Result<()> {
        self.sql.drop_user(admin, username).await
    }

    pub async fn set_password(&self, admin: &CredentialBundle, username: &str, password: &str) -> Result<()> {
        self.sql.set_password(admin, username, password).await
    }
}

/// Quote an identifier, doubling embedded double quotes
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal, doubling embedded single quotes
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn create_database_statement(name: &str, options: &DatabaseOptions) -> String {
    let mut statement = format!("CREATE DATABASE {}", quote_identifier(name));
    if let Some(charset) = &options.charset {
        statement.push_str(&format!(" ENCODING {}", quote_literal(charset)));
    }
    if let Some(collation) = &options.collation {
        statement.push_str(&format!(
            " LC_COLLATE {} LC_CTYPE {}",
            quote_literal(collation),
            quote_literal(collation)
        ));
    }
    if options.charset.is_some() || options.collation.is_some() {
        statement.push_str(" TEMPLATE template0");
    }
    statement
}

/// [`SqlAdmin`] over tokio-postgres, one short-lived connection per call
#[derive(Clone, Debug)]
pub struct PostgresAdmin {
    connect_timeout: Duration,
}

impl Default for PostgresAdmin {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl PostgresAdmin {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn connect(&self, admin: &CredentialBundle, dbname: Option<&str>) -> Result<Client> {
        let port: u16 = admin
            .port
            .parse()
            .map_err(|_| Error::config(format!("Invalid port '{}' in admin credentials", admin.port)))?;

        let mut config = tokio_postgres::Config::new();
        config
            .host(&admin.host)
            .port(port)
            .user(&admin.username)
            .password(&admin.password)
            .dbname(dbname.unwrap_or(&admin.dbname))
            .connect_timeout(self.connect_timeout)
            .application_name("postgres-provisioning-operator");

        let client = if admin.sslmode == "disable" {
            config.ssl_mode(SslMode::Disable);
            let (client, connection) = config.connect(NoTls).await?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    trace!(error = %e, "PostgreSQL connection closed");
                }
            });
            client
        } else {
            config.ssl_mode(SslMode::Require);
            let (client, connection) = config.connect(tls_connector()).await?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    trace!(error = %e, "PostgreSQL TLS connection closed");
                }
            });
            client
        };

        Ok(client)
    }
}

#[async_trait]
impl SqlAdmin for PostgresAdmin {
    async fn database_exists(&self, admin: &CredentialBundle, name: &str) -> Result<bool> {
        let client = self.connect(admin, None).await?;
        let row = client
            .query_opt("SELECT 1 FROM pg_database WHERE datname = $1", &[&name])
            .await?;
        Ok(row.is_some())
    }

    async fn create_database(&self, admin: &CredentialBundle, name: &str, options: &DatabaseOptions) -> Result<bool> {
        let client = self.connect(admin, None).await?;
        let existing = client
            .query_opt("SELECT 1 FROM pg_database WHERE datname = $1", &[&name])
            .await?;
        if existing.is_some() {
            return Ok(false);
        }
        client
            .batch_execute(&create_database_statement(name, options))
            .await?;
        Ok(true)
    }

    async fn revoke_public_access(&self, admin: &CredentialBundle, name: &str) -> Result<()> {
        let client = self.connect(admin, None).await?;
        client
            .batch_execute(&format!(
                "REVOKE ALL PRIVILEGES ON DATABASE {} FROM PUBLIC",
                quote_identifier(name)
            ))
            .await?;
        Ok(())
    }

    async fn create_extension(&self, admin: &CredentialBundle, database: &str, extension: &str) -> Result<()> {
        let client = self.connect(admin, Some(database)).await?;
        client
            .batch_execute(&format!(
                "CREATE EXTENSION IF NOT EXISTS {} CASCADE",
                quote_identifier(extension)
            ))
            .await?;
        Ok(())
    }

    async fn drop_database(&self, admin: &CredentialBundle, name: &str) -> Result<()> {
        let client = self.connect(admin, None).await?;
        client
            .batch_execute(&format!("DROP DATABASE IF EXISTS {}", quote_identifier(name)))
            .await?;
        Ok(())
    }

    async fn create_or_update_user(
        &self,
        admin: &CredentialBundle,
        username: &str,
        password: &str,
        database: &str,
    ) -> Result<bool> {
        let client = self.connect(admin, Some(database)).await?;
        let existing = client
            .query_opt("SELECT 1 FROM pg_catalog.pg_roles WHERE rolname = $1", &[&username])
            .await?;
        let created = existing.is_none();
        if created {
            client
                .batch_execute(&format!(
                    "CREATE ROLE {} WITH LOGIN ENCRYPTED PASSWORD {}",
                    quote_identifier(username),
                    quote_literal(password)
                ))
                .await?;
        }
        client
            .batch_execute(&format!(
                "GRANT ALL PRIVILEGES ON DATABASE {db} TO {role}; \
                 GRANT ALL PRIVILEGES ON SCHEMA public TO {role}",
                db = quote_identifier(database),
                role = quote_identifier(username)
            ))
            .await?;
        Ok(created)
    }

    async fn drop_user(&self, admin: &CredentialBundle, username: &str) -> Result<()> {
        let client = self.connect(admin, None).await?;
        client
            .batch_execute(&format!("DROP ROLE IF EXISTS {}", quote_identifier(username)))
            .await?;
        Ok(())
    }

    async fn set_password(&self, admin: &CredentialBundle, username: &str, password: &str) -> Result<()> {
        let client = self.connect(admin, None).await?;
        client
            .batch_execute(&format!(
                "ALTER ROLE {} WITH ENCRYPTED PASSWORD {}",
                quote_identifier(username),
                quote_literal(password)
            ))
            .await?;
        Ok(())
    }
}

/// TLS without certificate verification, matching libpq `sslmode=require`
fn tls_connector() -> MakeRustlsConnect {
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth();
    MakeRustlsConnect::new(config)
}

#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::CryptoProvider::get_default()
            .map(|provider| {
                provider
                    .signature_verification_algorithms
                    .supported_schemes()
            })
            .unwrap_or_else(|| {
                vec![
                    rustls::SignatureScheme::RSA_PKCS1_SHA256,
                    rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
                    rustls::SignatureScheme::RSA_PSS_SHA256,
                    rustls::SignatureScheme::ED25519,
                ]
            })
    }
}
