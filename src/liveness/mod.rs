//! Liveness-tracking policy (spec.md section 4.3): how a sampled
//! allocation is recognized again at free time.
//!
//! Exactly one policy is compiled into a given build of this crate,
//! selected by a Cargo feature: a closed set, chosen once, with no
//! runtime polymorphism between the three options.

#[cfg(feature = "policy-all-headers")]
pub mod all_headers;
#[cfg(feature = "policy-sample-headers")]
pub mod sample_headers;
#[cfg(feature = "policy-stateless")]
pub mod stateless;

/// Which liveness-tracking storage strategy is active.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Policy {
    AllHeaders,
    SampleHeaders,
    Stateless,
}

impl Policy {
    pub fn as_str(self) -> &'static str {
        match self {
            Policy::AllHeaders => "all_headers",
            Policy::SampleHeaders => "sample_headers",
            Policy::Stateless => "stateless",
        }
    }
}

#[cfg(all(feature = "policy-all-headers", feature = "policy-sample-headers"))]
compile_error!("at most one of policy-all-headers/policy-sample-headers/policy-stateless may be enabled");
#[cfg(all(feature = "policy-all-headers", feature = "policy-stateless"))]
compile_error!("at most one of policy-all-headers/policy-sample-headers/policy-stateless may be enabled");
#[cfg(all(feature = "policy-sample-headers", feature = "policy-stateless"))]
compile_error!("at most one of policy-all-headers/policy-sample-headers/policy-stateless may be enabled");
#[cfg(not(any(
    feature = "policy-all-headers",
    feature = "policy-sample-headers",
    feature = "policy-stateless"
)))]
compile_error!("exactly one of policy-all-headers/policy-sample-headers/policy-stateless must be enabled");

#[cfg(feature = "policy-all-headers")]
pub const ACTIVE_POLICY: Policy = Policy::AllHeaders;
#[cfg(feature = "policy-sample-headers")]
pub const ACTIVE_POLICY: Policy = Policy::SampleHeaders;
#[cfg(feature = "policy-stateless")]
pub const ACTIVE_POLICY: Policy = Policy::Stateless;
