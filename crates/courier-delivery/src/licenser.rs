//! Capability gate for optional features.
//!
//! The licenser is consulted at every gate that belongs to a licensed
//! feature: IP rules, circuit breaking, advanced endpoint management and
//! forward-proxy dispatch. Unlicensed features are skipped, never failed.

/// Boolean capability oracle.
pub trait Licenser: Send + Sync {
    /// May the dispatcher apply IP allow/block rules?
    fn ip_rules(&self) -> bool;

    /// May the processor disable and re-enable endpoints?
    fn advanced_endpoint_mgmt(&self) -> bool;

    /// May the processor consult the circuit breaker?
    fn circuit_breaking(&self) -> bool;

    /// May the dispatcher route through the forward proxy?
    fn use_forward_proxy(&self) -> bool;
}

/// A licenser with fixed answers. The community build uses the default
/// (everything off); tests and licensed builds flip capabilities on.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticLicenser {
    ip_rules: bool,
    advanced_endpoint_mgmt: bool,
    circuit_breaking: bool,
    use_forward_proxy: bool,
}

impl StaticLicenser {
    /// Every capability enabled.
    #[must_use]
    pub fn all() -> Self {
        Self {
            ip_rules: true,
            advanced_endpoint_mgmt: true,
            circuit_breaking: true,
            use_forward_proxy: true,
        }
    }

    #[must_use]
    pub fn with_ip_rules(mut self, enabled: bool) -> Self {
        self.ip_rules = enabled;
        self
    }

    #[must_use]
    pub fn with_advanced_endpoint_mgmt(mut self, enabled: bool) -> Self {
        self.advanced_endpoint_mgmt = enabled;
        self
    }

    #[must_use]
    pub fn with_circuit_breaking(mut self, enabled: bool) -> Self {
        self.circuit_breaking = enabled;
        self
    }

    #[must_use]
    pub fn with_forward_proxy(mut self, enabled: bool) -> Self {
        self.use_forward_proxy = enabled;
        self
    }
}

impl Licenser for StaticLicenser {
    fn ip_rules(&self) -> bool {
        self.ip_rules
    }

    fn advanced_endpoint_mgmt(&self) -> bool {
        self.advanced_endpoint_mgmt
    }

    fn circuit_breaking(&self) -> bool {
        self.circuit_breaking
    }

    fn use_forward_proxy(&self) -> bool {
        self.use_forward_proxy
    }
}
