mod common;

use anyhow::Result;
use common::*;
use dialx::{
    DialError, DialOption, Dialer, FailureKind, TlsFailureReport, TlsParams, TlsStrategy,
    dial_tls_timeout,
};
use rustls::pki_types::PrivateKeyDer;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::sync::Arc;
use std::time::Duration;

fn tls_to_localhost(extra: &[DialOption]) -> Vec<DialOption> {
    let mut opts = vec![
        DialOption::Tls(true),
        DialOption::Sni("localhost".into()),
        DialOption::Timeout(Duration::from_secs(5)),
        DialOption::TlsTimeout(Duration::from_secs(5)),
    ];
    opts.extend_from_slice(extra);
    opts
}

fn exhausted(err: DialError) -> Box<TlsFailureReport> {
    match err {
        DialError::TlsExhausted(report) => report,
        other => panic!("expected aggregated tls error, got {other}"),
    }
}

#[tokio::test]
async fn ordinary_tls_negotiates_alpn() -> Result<()> {
    let server = spawn_tls_server(self_signed_server_config(&["h2", "http/1.1"])?).await?;

    let mut conn = Dialer::new()
        .dial(
            &server.addr.to_string(),
            &tls_to_localhost(&[DialOption::Alpn(vec!["h2".into()])]),
        )
        .await?;
    echo_roundtrip(&mut conn, b"over tls").await?;

    assert!(conn.is_tls());
    assert_eq!(conn.tls_strategy(), Some(TlsStrategy::Ordinary));
    assert_eq!(conn.negotiated_alpn(), Some(&b"h2"[..]));
    assert_eq!(server.accepts.get(), 1);
    assert_eq!(server.handshakes.get(), 1);
    Ok(())
}

#[tokio::test]
async fn gm_only_failure_aggregates_both_gm_attempts() -> Result<()> {
    let server = spawn_tls_server(self_signed_server_config(&[])?).await?;
    let gm = Arc::new(FailingGm::default());

    let err = Dialer::new()
        .with_gm_connector(gm.clone())
        .dial(
            &server.addr.to_string(),
            &tls_to_localhost(&[DialOption::GmOnly(true)]),
        )
        .await
        .unwrap_err();
    let report = exhausted(err);

    let tried: Vec<_> = report.attempts.iter().map(|(s, _)| *s).collect();
    assert_eq!(
        tried,
        vec![TlsStrategy::GmWithSupport, TlsStrategy::GmWithoutSupport]
    );
    assert_eq!(report.friendly.kind, FailureKind::Handshake);
    assert!(
        report.friendly.suggestions.iter().any(|s| s.contains("GM-only")),
        "{:?}",
        report.friendly.suggestions
    );
    assert!(report.config_summary.contains("gm-with-support -> gm-without-support"));

    // one fresh plain connection per strategy
    assert_eq!(server.accepts.get(), 2);
    assert_eq!(gm.calls.get(), 2);
    assert_eq!(*gm.gm_support.lock(), vec![true, false]);

    let rendered = DialError::TlsExhausted(report).to_string();
    assert!(rendered.contains("gm-with-support"), "{rendered}");
    assert!(rendered.contains("sm2 cipher suites"), "{rendered}");
    Ok(())
}

#[tokio::test]
async fn gm_prefer_falls_back_to_ordinary() -> Result<()> {
    let server = spawn_tls_server(self_signed_server_config(&[])?).await?;
    let gm = Arc::new(FailingGm::default());

    let mut conn = Dialer::new()
        .with_gm_connector(gm.clone())
        .dial(
            &server.addr.to_string(),
            &tls_to_localhost(&[DialOption::GmPrefer(true)]),
        )
        .await?;
    echo_roundtrip(&mut conn, b"second strategy").await?;

    assert_eq!(conn.tls_strategy(), Some(TlsStrategy::Ordinary));
    assert_eq!(gm.calls.get(), 1);
    assert_eq!(server.accepts.get(), 2);
    Ok(())
}

#[tokio::test]
async fn default_order_skips_gm_without_runtime() -> Result<()> {
    let (closer, accepts) = spawn_closer().await?;

    let err = Dialer::new()
        .dial(&closer.to_string(), &tls_to_localhost(&[]))
        .await
        .unwrap_err();
    let report = exhausted(err);

    assert_eq!(report.attempts.len(), 2);
    assert!(matches!(
        &report.attempts[0],
        (TlsStrategy::Ordinary, DialError::Handshake { .. })
    ));
    assert!(matches!(
        &report.attempts[1],
        (TlsStrategy::GmWithSupport, DialError::GmUnavailable)
    ));
    // the GM attempt never touched the network
    assert_eq!(accepts.get(), 1);
    assert_ne!(report.friendly.kind, FailureKind::GmUnavailable);
    Ok(())
}

#[tokio::test]
async fn registered_gm_runtime_carries_the_connection() -> Result<()> {
    let (echo, _) = spawn_echo().await?;
    let gm = Arc::new(PassthroughGm::default());

    let mut conn = Dialer::new()
        .with_gm_connector(gm.clone())
        .dial(
            &echo.to_string(),
            &tls_to_localhost(&[
                DialOption::GmOnly(true),
                DialOption::Alpn(vec!["h2".into()]),
            ]),
        )
        .await?;
    echo_roundtrip(&mut conn, b"sm4").await?;

    assert_eq!(conn.tls_strategy(), Some(TlsStrategy::GmWithSupport));
    assert_eq!(conn.negotiated_alpn(), Some(&b"h2"[..]));
    assert_eq!(gm.calls.get(), 1);
    Ok(())
}

#[tokio::test]
async fn plain_dial_failure_is_not_a_strategy_failure() {
    let err = Dialer::new()
        .dial(
            &format!("127.0.0.1:{}", closed_port()),
            &tls_to_localhost(&[]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DialError::Refused { .. }), "{err}");
}

#[tokio::test]
async fn detects_tls_services() -> Result<()> {
    let server = spawn_tls_server(self_signed_server_config(&[])?).await?;
    let (closer, _) = spawn_closer().await?;
    let dialer = Dialer::new();

    assert!(dialer.is_tls_service(&server.addr.to_string(), &[]).await);
    assert!(!dialer.is_tls_service(&closer.to_string(), &[]).await);
    Ok(())
}

#[tokio::test]
async fn verification_rejects_self_signed() -> Result<()> {
    let server = spawn_tls_server(self_signed_server_config(&[])?).await?;

    let err = Dialer::new()
        .dial(
            &server.addr.to_string(),
            &tls_to_localhost(&[DialOption::InsecureSkipVerify(false)]),
        )
        .await
        .unwrap_err();
    let report = exhausted(err);
    assert_eq!(report.friendly.kind, FailureKind::Certificate);
    assert!(report.config_summary.contains("insecure: false"));
    Ok(())
}

#[tokio::test]
async fn ordinary_override_is_used_as_template() -> Result<()> {
    use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};

    let mut ca_params = CertificateParams::new(Vec::<String>::new())?;
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca_key = KeyPair::generate()?;
    let ca_cert = ca_params.self_signed(&ca_key)?;
    let leaf_key = KeyPair::generate()?;
    let leaf = CertificateParams::new(vec!["localhost".to_string()])?
        .signed_by(&leaf_key, &ca_cert, &ca_key)?;

    let key = PrivateKeyDer::Pkcs8(leaf_key.serialize_der().into());
    let mut server_config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(vec![leaf.der().clone()], key)?;
    server_config.alpn_protocols = vec![b"h2".to_vec()];
    let server = spawn_tls_server(server_config).await?;

    // trusts exactly the test CA
    let mut roots = RootCertStore::empty();
    roots.add(ca_cert.der().clone())?;
    let template = Arc::new(
        ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth(),
    );

    let mut conn = Dialer::new()
        .dial(
            &server.addr.to_string(),
            &tls_to_localhost(&[
                DialOption::TlsParams(TlsParams::Ordinary(template.clone())),
                DialOption::InsecureSkipVerify(false),
                DialOption::Alpn(vec!["h2".into()]),
            ]),
        )
        .await?;
    echo_roundtrip(&mut conn, b"template").await?;
    assert_eq!(conn.negotiated_alpn(), Some(&b"h2"[..]));
    assert!(template.alpn_protocols.is_empty());
    Ok(())
}

#[tokio::test]
async fn client_certificate_is_presented_when_requested() -> Result<()> {
    let mtls = mutual_tls()?;
    let server = spawn_tls_server(mtls.server_config).await?;
    let dialer = Dialer::new();
    dialer.cert_store().insert(
        mtls.client_chain.clone(),
        mtls.client_key.clone_key(),
        Some("localhost"),
    )?;

    let mut conn = dialer
        .dial(&server.addr.to_string(), &tls_to_localhost(&[]))
        .await?;
    echo_roundtrip(&mut conn, b"mutual").await?;
    assert_eq!(server.handshakes.get(), 1);
    Ok(())
}

#[tokio::test]
async fn client_certificate_outside_scope_is_withheld() -> Result<()> {
    let mtls = mutual_tls()?;
    let server = spawn_tls_server(mtls.server_config).await?;
    let dialer = Dialer::new();
    dialer.cert_store().insert(
        mtls.client_chain.clone(),
        mtls.client_key.clone_key(),
        Some("other.test"),
    )?;

    // with TLS 1.3 the client may finish before the server rejects it
    if let Ok(mut conn) = dialer
        .dial(&server.addr.to_string(), &tls_to_localhost(&[]))
        .await
    {
        assert!(echo_roundtrip(&mut conn, b"no cert").await.is_err());
    }
    assert_eq!(server.handshakes.get(), 0);
    Ok(())
}

#[tokio::test]
async fn tls_wrapper_uses_sni_override() -> Result<()> {
    let server = spawn_tls_server(self_signed_server_config(&[])?).await?;
    let mut conn = dial_tls_timeout(
        &server.addr.to_string(),
        Duration::from_secs(5),
        Some("localhost"),
        &[],
    )
    .await?;
    echo_roundtrip(&mut conn, b"wrapper").await?;
    assert_eq!(conn.tls_strategy(), Some(TlsStrategy::Ordinary));
    Ok(())
}
