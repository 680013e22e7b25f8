use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};

/// Metrics for a [crate::SessionRegistry] and every link that shares it.
///
/// The cryptographic counters are incremented at every call site of the corresponding operation,
/// so they can be used to confirm that a resumed link performed no key agreement.
#[derive(Clone, Default)]
pub struct Metrics {
    /// Number of ephemeral Diffie-Hellman computations.
    pub key_agreements: Counter,

    /// Number of messages sealed to a peer's long-term key.
    pub asymmetric_encryptions: Counter,

    /// Number of sealed messages opened with our long-term key.
    pub asymmetric_decryptions: Counter,

    /// Number of signatures produced.
    pub signatures: Counter,

    /// Number of signatures checked.
    pub verifications: Counter,

    /// Number of links established by a full handshake.
    pub full_handshakes: Counter,

    /// Number of links established by resuming a cached session.
    pub resumes: Counter,

    /// Number of resume attempts declined by the peer and retried as a full handshake.
    pub resume_fallbacks: Counter,

    /// Number of negotiations that failed.
    pub negotiation_failures: Counter,

    /// Number of inbound negotiations refused by admission control.
    pub negotiations_refused: Counter,

    /// Number of cached session tokens.
    pub tokens: Gauge,

    /// Number of inbound negotiations in flight.
    pub inbound_negotiations: Gauge,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given context.
    pub fn init<E: RuntimeMetrics>(context: E) -> Self {
        let metrics = Self::default();
        context.register(
            "key_agreements",
            "Number of ephemeral Diffie-Hellman computations",
            metrics.key_agreements.clone(),
        );
        context.register(
            "asymmetric_encryptions",
            "Number of messages sealed to a peer's long-term key",
            metrics.asymmetric_encryptions.clone(),
        );
        context.register(
            "asymmetric_decryptions",
            "Number of sealed messages opened with our long-term key",
            metrics.asymmetric_decryptions.clone(),
        );
        context.register(
            "signatures",
            "Number of signatures produced",
            metrics.signatures.clone(),
        );
        context.register(
            "verifications",
            "Number of signatures checked",
            metrics.verifications.clone(),
        );
        context.register(
            "full_handshakes",
            "Number of links established by a full handshake",
            metrics.full_handshakes.clone(),
        );
        context.register(
            "resumes",
            "Number of links established by resuming a cached session",
            metrics.resumes.clone(),
        );
        context.register(
            "resume_fallbacks",
            "Number of declined resume attempts retried as a full handshake",
            metrics.resume_fallbacks.clone(),
        );
        context.register(
            "negotiation_failures",
            "Number of negotiations that failed",
            metrics.negotiation_failures.clone(),
        );
        context.register(
            "negotiations_refused",
            "Number of inbound negotiations refused by admission control",
            metrics.negotiations_refused.clone(),
        );
        context.register(
            "tokens",
            "Number of cached session tokens",
            metrics.tokens.clone(),
        );
        context.register(
            "inbound_negotiations",
            "Number of inbound negotiations in flight",
            metrics.inbound_negotiations.clone(),
        );
        metrics
    }
}
