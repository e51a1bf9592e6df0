use std::fmt;

/// TlsStrategy is one way of attempting a TLS handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlsStrategy {
    /// Ordinary TLS 1.2/1.3 cipher suites
    Ordinary,
    /// GM-cipher TLS with national-cipher negotiation enabled
    GmWithSupport,
    /// GM-cipher TLS runtime with national-cipher negotiation disabled
    GmWithoutSupport,
}

impl TlsStrategy {
    pub fn is_gm(&self) -> bool {
        !matches!(self, TlsStrategy::Ordinary)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TlsStrategy::Ordinary => "ordinary",
            TlsStrategy::GmWithSupport => "gm-with-support",
            TlsStrategy::GmWithoutSupport => "gm-without-support",
        }
    }
}

impl fmt::Display for TlsStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// GmFlags select which TLS strategies a dial tries and in what order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GmFlags {
    /// GM TLS may be used at all
    pub support: bool,
    /// Only GM TLS may be used
    pub only: bool,
    /// GM TLS is tried before ordinary TLS
    pub prefer: bool,
}

impl Default for GmFlags {
    fn default() -> Self {
        Self {
            support: true,
            only: false,
            prefer: false,
        }
    }
}

/// select_strategies computes the ordered strategy list for one dial
pub fn select_strategies(flags: GmFlags) -> Vec<TlsStrategy> {
    if flags.only {
        vec![TlsStrategy::GmWithSupport, TlsStrategy::GmWithoutSupport]
    } else if !flags.support && !flags.prefer {
        vec![TlsStrategy::Ordinary]
    } else if flags.prefer {
        vec![TlsStrategy::GmWithSupport, TlsStrategy::Ordinary]
    } else {
        vec![TlsStrategy::Ordinary, TlsStrategy::GmWithSupport]
    }
}
