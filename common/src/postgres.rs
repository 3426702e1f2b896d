use crate::args::PostgresArgs;
use anyhow::{Context, Result, bail};
use deadpool_postgres::{Config as PgConfig, ManagerConfig, Pool, RecyclingMethod};
use postgres::NoTls;
use rustls::pki_types::CertificateDer;

/// Build the shared connection pool. A CA certificate in the args enables
/// TLS with that certificate added to the platform roots.
pub async fn create_pool(pg_args: PostgresArgs) -> Result<Pool> {
    let mut tls_connector = None;
    if let Some(ref ca_cert) = pg_args.postgres_ca_cert {
        let extra_roots =
            parse_ca_certs(ca_cert.as_bytes()).context("Failed to parse CA certificate")?;
        tls_connector =
            Some(crate::make_rustls(extra_roots).context("Failed to create Rustls connector")?);
    }
    let mut pg_pool_cfg = PgConfig::new();
    pg_pool_cfg.dbname = Some(pg_args.postgres_database);
    pg_pool_cfg.host = Some(pg_args.postgres_host);
    pg_pool_cfg.port = Some(pg_args.postgres_port);
    pg_pool_cfg.user = Some(pg_args.postgres_username);
    pg_pool_cfg.password = pg_args
        .postgres_password
        .or_else(|| std::env::var("POSTGRES_PASSWORD").ok());
    pg_pool_cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });
    let pool = if let Some(tls) = tls_connector {
        pg_pool_cfg
            .create_pool(Some(deadpool_postgres::Runtime::Tokio1), tls)
            .context("Failed to create Postgres pool")?
    } else {
        pg_pool_cfg
            .create_pool(Some(deadpool_postgres::Runtime::Tokio1), NoTls)
            .context("Failed to create Postgres pool")?
    };
    Ok(pool)
}

fn parse_ca_certs(bytes: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    // If it's PEM, decode all the certs; otherwise treat as raw DER
    if bytes.starts_with(b"-----BEGIN") {
        let mut rd: &[u8] = bytes;
        let mut out = Vec::new();
        for item in rustls_pemfile::read_all(&mut rd) {
            let item = item.map_err(|e| anyhow::anyhow!("failed to parse PEM bundle: {}", e))?;
            if let rustls_pemfile::Item::X509Certificate(der) = item {
                out.push(der);
            }
        }
        if out.is_empty() {
            bail!("no X509 certificates found in provided PEM");
        }
        Ok(out)
    } else {
        Ok(vec![CertificateDer::from(bytes.to_vec())])
    }
}
