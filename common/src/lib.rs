use std::net::IpAddr;

use anyhow::Result;
use axum::{Json, http::HeaderMap, response::IntoResponse};
use owo_colors::OwoColorize;
use reqwest::StatusCode;
use rustls::{ClientConfig, RootCertStore, pki_types::CertificateDer};
use tokio_postgres_rustls::MakeRustlsConnect;

pub mod args;
pub mod postgres;
pub mod shutdown;
pub mod wait;

/// Process-wide one-time setup: color handling and the rustls provider.
pub fn init() {
    let disable_colors = ["1", "true"].contains(
        &std::env::var("DISABLE_COLORS")
            .unwrap_or_else(|_| String::new())
            .to_lowercase()
            .as_str(),
    );
    owo_colors::set_override(!disable_colors);

    install_rustls_provider();
}

pub fn install_rustls_provider() {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("install aws-lc-rs provider");
}

/// Marks the pod ready for the container's exec readiness probe.
pub fn signal_ready() {
    std::fs::write("/etc/ready", "ready").expect("Failed to write readiness file");
}

pub fn make_rustls(certs: Vec<CertificateDer<'_>>) -> Result<MakeRustlsConnect> {
    let mut roots = RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().expect("could not load platform certs") {
        roots.add(cert).unwrap();
    }
    for cert in certs {
        roots.add(cert)?;
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(MakeRustlsConnect::new(config))
}

pub mod response {
    use std::fmt::{Debug, Display};

    use anyhow::Error;
    use axum::response::Response;

    use super::*;

    pub fn print_error<T>(e: T)
    where
        T: Into<Error> + Display + Debug,
    {
        eprintln!(
            "❌ {}",
            format!("{:?}", e.into())
                .split("\n")
                .map(|s| s.red().to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        );
    }

    pub fn err_resp<T>(e: T, code: StatusCode) -> Response
    where
        T: Into<Error> + Display + Debug,
    {
        let reason = format!("{}", e);
        print_error(e);
        (code, Json(serde_json::json!({"reason": reason}))).into_response()
    }
}

pub mod access_log {
    use super::*;

    pub async fn public(
        req: axum::extract::Request,
        next: axum::middleware::Next,
    ) -> axum::response::Response {
        request("PUBLIC", req, next, false).await
    }

    pub async fn request(
        prefix: &str,
        req: axum::extract::Request,
        next: axum::middleware::Next,
        errors_only: bool,
    ) -> axum::response::Response {
        let ip = get_source_ip(req.headers())
            .map(|ip| ip.to_string())
            .unwrap_or("unknown".into());
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let start = std::time::Instant::now();
        let response = next.run(req).await;
        let duration = start.elapsed();
        let is_success = response.status().is_success();
        if is_success && errors_only {
            return response; // Skip non-error logs
        }
        let (a, b) = if is_success {
            ((20, 163, 73), (25, 163, 118))
        } else {
            ((230, 126, 16), (171, 85, 17))
        };
        println!(
            "🧾 {} {} {} {} {} {}{}{} {}{}",
            format!("[{}]", prefix).truecolor(a.0, a.1, a.2),
            method.truecolor(b.0, b.1, b.2),
            path.truecolor(b.0, b.1, b.2),
            "→".truecolor(a.0, a.1, a.2),
            response.status().truecolor(b.0, b.1, b.2),
            "(".truecolor(a.0, a.1, a.2),
            format!("{:?}", duration).truecolor(b.0, b.1, b.2),
            ")".truecolor(a.0, a.1, a.2),
            "xff=".magenta(),
            ip.magenta().dimmed(),
        );
        response
    }
}

pub fn get_source_ip(headers: &HeaderMap) -> Option<IpAddr> {
    // Prefer X-Forwarded-For (may contain multiple)
    if let Some(forwarded_for) = headers.get("x-forwarded-for")
        && let Ok(forwarded_for) = forwarded_for.to_str()
        && let Some(ip_str) = forwarded_for.split(',').next()
        && let Ok(ip) = ip_str.trim().parse()
    {
        return Some(ip);
    }

    // Fallback to X-Real-IP
    if let Some(real_ip) = headers.get("x-real-ip")
        && let Ok(ip_str) = real_ip.to_str()
        && let Ok(ip) = ip_str.trim().parse()
    {
        return Some(ip);
    }

    None
}
