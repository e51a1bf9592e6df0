//! Client certificate store for mutual TLS
//!
//! Certificates are loaded from PKCS#12 bytes and offered to servers that send
//! a CertificateRequest. Entries are tried in load order and the first one
//! whose key can sign with an offered scheme and whose issuer matches one of
//! the server's acceptable CAs wins. A server that names no CAs accepts any.

use crate::error::DialError;
use p12_keystore::{KeyStore, KeyStoreEntry};
use parking_lot::RwLock;
use rustls::SignatureScheme;
use rustls::client::ResolvesClientCert;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use x509_parser::asn1_rs::{Any, FromDer, Tag};

struct CertEntry {
    host_scope: Option<String>,
    key: Arc<CertifiedKey>,
    /// Raw DER issuer names of every certificate in the chain
    issuers: Vec<Vec<u8>>,
}

impl CertEntry {
    fn in_scope(&self, server_name: &str) -> bool {
        match &self.host_scope {
            None => true,
            Some(scope) => scope.eq_ignore_ascii_case(server_name),
        }
    }

    fn issued_by_any(&self, root_hint_subjects: &[&[u8]]) -> bool {
        if root_hint_subjects.is_empty() {
            return true;
        }
        self.issuers.iter().any(|issuer| {
            let inner = strip_sequence(issuer);
            root_hint_subjects
                .iter()
                .any(|hint| *hint == issuer.as_slice() || Some(*hint) == inner)
        })
    }
}

/// ClientCertStore is an ordered, append-only list of client certificates
#[derive(Default)]
pub struct ClientCertStore {
    entries: RwLock<Vec<Arc<CertEntry>>>,
}

impl fmt::Debug for ClientCertStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCertStore")
            .field("entries", &self.entries.read().len())
            .finish()
    }
}

impl ClientCertStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// load_p12 appends every key/chain pair found in a PKCS#12 bundle
    ///
    /// With `host_scope` set the certificates are only offered to that SNI.
    /// Returns the number of entries added.
    pub fn load_p12(
        &self,
        bytes: &[u8],
        password: &str,
        host_scope: Option<&str>,
    ) -> Result<usize, DialError> {
        let keystore = KeyStore::from_pkcs12(bytes, password)
            .map_err(|e| DialError::ClientCert(format!("cannot parse pkcs#12: {e}")))?;

        let mut added = 0;
        for (alias, entry) in keystore.entries() {
            let KeyStoreEntry::PrivateKeyChain(chain) = entry else {
                continue;
            };
            let certs: Vec<CertificateDer<'static>> = chain
                .chain()
                .iter()
                .map(|c| CertificateDer::from(c.as_der().to_vec()))
                .collect();
            let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(chain.key().to_vec()));
            self.insert(certs, key, host_scope)?;
            debug!("loaded client certificate {:?}", alias);
            added += 1;
        }
        if added == 0 {
            return Err(DialError::ClientCert(
                "pkcs#12 bundle holds no private key with a certificate chain".into(),
            ));
        }
        Ok(added)
    }

    /// insert appends one leaf-first certificate chain with its private key
    pub fn insert(
        &self,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        host_scope: Option<&str>,
    ) -> Result<(), DialError> {
        if chain.is_empty() {
            return Err(DialError::ClientCert("empty certificate chain".into()));
        }
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
            .map_err(|e| DialError::ClientCert(format!("unsupported private key: {e}")))?;

        let mut issuers = Vec::with_capacity(chain.len());
        for cert in &chain {
            let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref())
                .map_err(|e| DialError::ClientCert(format!("cannot parse certificate: {e}")))?;
            issuers.push(parsed.issuer().as_raw().to_vec());
        }

        self.entries.write().push(Arc::new(CertEntry {
            host_scope: host_scope
                .filter(|h| !h.is_empty())
                .map(|h| h.to_ascii_lowercase()),
            key: Arc::new(CertifiedKey::new(chain, signing_key)),
            issuers,
        }));
        Ok(())
    }

    /// reset drops every loaded certificate
    pub fn reset(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// resolver_for snapshots the entries usable for `server_name`
    pub fn resolver_for(&self, server_name: &str) -> Option<Arc<dyn ResolvesClientCert>> {
        let entries: Vec<_> = self
            .entries
            .read()
            .iter()
            .filter(|e| e.in_scope(server_name))
            .cloned()
            .collect();
        if entries.is_empty() {
            return None;
        }
        Some(Arc::new(CertChooser { entries }))
    }
}

struct CertChooser {
    entries: Vec<Arc<CertEntry>>,
}

impl fmt::Debug for CertChooser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertChooser")
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl ResolvesClientCert for CertChooser {
    fn resolve(
        &self,
        root_hint_subjects: &[&[u8]],
        sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        self.entries
            .iter()
            .find(|e| {
                e.issued_by_any(root_hint_subjects)
                    && e.key.key.choose_scheme(sigschemes).is_some()
            })
            .map(|e| e.key.clone())
    }

    fn has_certs(&self) -> bool {
        !self.entries.is_empty()
    }
}

// Content of a DER SEQUENCE without its tag and length
fn strip_sequence(der: &[u8]) -> Option<&[u8]> {
    match Any::from_der(der) {
        Ok((_, any)) if any.tag() == Tag::Sequence => Some(any.data),
        _ => None,
    }
}
