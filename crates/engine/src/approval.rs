//! Approval adapter: bridges deferred policy decisions to an external UI.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use remotedrop_protocol::MIN_APPROVAL_TIMEOUT;
use remotedrop_transfer::TransferRequest;

/// Extensions that can execute code on this host. Prompts for these are
/// annotated so the UI defaults to Deny.
pub const HIGH_RISK_EXTENSIONS: &[&str] = &[
    "exe", "bat", "cmd", "com", "scr", "pif", "vbs", "vbe", "js", "jse", "wsf", "wsh", "msi",
    "msp", "hta", "cpl", "jar", "app", "deb", "rpm", "dmg", "pkg", "run", "bin", "sh", "ps1",
    "psm1", "psd1", "ps1xml",
];

/// Whether a filename carries a high-risk extension.
pub fn is_high_risk(filename: &str) -> bool {
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
            let ext = ext.to_lowercase();
            HIGH_RISK_EXTENSIONS.contains(&ext.as_str())
        }
        _ => false,
    }
}

/// The user's answer to an approval prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalDecision {
    pub approved: bool,
    pub message: String,
    /// Persist the decision keyed by request id.
    pub remember: bool,
}

impl ApprovalDecision {
    pub fn timed_out() -> Self {
        Self {
            approved: false,
            message: "timed out".into(),
            remember: false,
        }
    }
}

/// Boxed future returned by [`ApprovalUi::prompt`].
pub type ApprovalFuture = Pin<Box<dyn Future<Output = ApprovalDecision> + Send + 'static>>;

/// Capability interface to the approval UI.
///
/// The engine knows nothing about rendering; implementors present the
/// request however they like and resolve with the user's decision.
/// `high_risk` marks requests whose extension can execute code — the UI
/// should default to Deny for those.
pub trait ApprovalUi: Send + Sync + 'static {
    fn prompt(&self, request: &TransferRequest, high_risk: bool) -> ApprovalFuture;
}

/// Enforces the prompt timeout around an [`ApprovalUi`].
pub struct ApprovalAdapter {
    ui: Arc<dyn ApprovalUi>,
}

impl ApprovalAdapter {
    pub fn new(ui: Arc<dyn ApprovalUi>) -> Self {
        Self { ui }
    }

    /// Prompts the UI and resolves within `timeout` (clamped to the
    /// 5-second minimum). Expiry resolves as a deny with "timed out".
    pub async fn request_decision(
        &self,
        request: &TransferRequest,
        timeout: Duration,
    ) -> ApprovalDecision {
        let timeout = timeout.max(MIN_APPROVAL_TIMEOUT);
        let high_risk = is_high_risk(&request.filename);
        match tokio::time::timeout(timeout, self.ui.prompt(request, high_risk)).await {
            Ok(decision) => decision,
            Err(_) => {
                warn!(
                    transfer_id = %request.id,
                    timeout_secs = timeout.as_secs(),
                    "approval prompt timed out, denying"
                );
                ApprovalDecision::timed_out()
            }
        }
    }
}
