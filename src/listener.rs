//! The listener (C8): opens the plaintext TCP endpoint and, if certificate material is
//! configured, a second TLS endpoint, each handing accepted connections to the C7 protocol
//! handler. Grounded on `other_examples/9105c5fc_JoelLinn-sql2ldap__src-main.rs.rs`'s
//! `acceptor`/`handle_client` shape; TLS support layers a `tokio_rustls::TlsAcceptor` in
//! front of the accepted socket, following the same accept-then-spawn pattern.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_rustls::rustls::{self, Certificate, PrivateKey};
use tokio_rustls::TlsAcceptor;

use crate::error::{Error, Result};
use crate::ldap_server::{self, Context};

/// Binds the configured plaintext port and, if both TLS keys are present, the TLS port.
/// Runs until interrupted by `SIGINT`/`SIGTERM` (or, off Unix, `ctrl_c`).
///
/// # Errors
///
/// Returns an error if a configured listening address cannot be bound, or if TLS material is
/// configured but cannot be loaded — both are fatal at startup per `SPEC_FULL.md` §6.
pub async fn run(ctx: Context) -> Result<()> {
    let plain_addr = format!("0.0.0.0:{}", ctx.config.port);
    let plain_listener = TcpListener::bind(&plain_addr)
        .await
        .map_err(|err| Error::ConfigInvalid(format!("cannot bind ldap port {plain_addr}: {err}")))?;
    log::info!("serving ldap:// on {plain_addr}");
    tokio::spawn(accept_plain(plain_listener, ctx.clone()));

    if let (Some(cert_path), Some(key_path)) =
        (&ctx.config.tls_certificate_path, &ctx.config.tls_private_key_path)
    {
        let acceptor = build_tls_acceptor(cert_path, key_path)?;
        let tls_addr = format!("0.0.0.0:{}", ctx.config.tls_port);
        let tls_listener = TcpListener::bind(&tls_addr)
            .await
            .map_err(|err| Error::ConfigInvalid(format!("cannot bind ldaps port {tls_addr}: {err}")))?;
        log::info!("serving ldaps:// on {tls_addr}");
        tokio::spawn(accept_tls(tls_listener, acceptor, ctx.clone()));
    }

    wait_for_shutdown().await;
    log::info!("shutting down");
    Ok(())
}

async fn accept_plain(listener: TcpListener, ctx: Context) {
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                log::debug!("accepted ldap connection from {peer}");
                tokio::spawn(ldap_server::handle_connection(socket, ctx.clone()));
            }
            Err(err) => log::warn!("failed to accept ldap connection: {err}"),
        }
    }
}

async fn accept_tls(listener: TcpListener, acceptor: TlsAcceptor, ctx: Context) {
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                let acceptor = acceptor.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    match acceptor.accept(socket).await {
                        Ok(tls_stream) => {
                            log::debug!("accepted ldaps connection from {peer}");
                            ldap_server::handle_connection(tls_stream, ctx).await;
                        }
                        Err(err) => log::warn!("tls handshake with {peer} failed: {err}"),
                    }
                });
            }
            Err(err) => log::warn!("failed to accept ldaps connection: {err}"),
        }
    }
}

fn build_tls_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor> {
    let cert_file = File::open(cert_path)
        .map_err(|err| Error::ConfigInvalid(format!("cannot open tls certificate {cert_path}: {err}")))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .map_err(|err| Error::ConfigInvalid(format!("cannot parse tls certificate {cert_path}: {err}")))?
        .into_iter()
        .map(Certificate)
        .collect::<Vec<_>>();
    if certs.is_empty() {
        return Err(Error::ConfigInvalid(format!("no certificates found in {cert_path}")));
    }

    let key_file = File::open(key_path)
        .map_err(|err| Error::ConfigInvalid(format!("cannot open tls private key {key_path}: {err}")))?;
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(key_file))
        .map_err(|err| Error::ConfigInvalid(format!("cannot parse tls private key {key_path}: {err}")))?;
    let key = keys
        .pop()
        .map(PrivateKey)
        .ok_or_else(|| Error::ConfigInvalid(format!("no private key found in {key_path}")))?;

    let server_config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| Error::ConfigInvalid(format!("invalid tls certificate/key pair: {err}")))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

#[cfg(target_family = "unix")]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut interrupt = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut terminate = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(target_family = "unix"))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
