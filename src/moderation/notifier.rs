//! Best-effort operator notifications
//!
//! Nothing here returns an error: a failed send is logged and dropped.

use crate::duration::format_duration;
use crate::moderation::{
    ChatTransport, FanOutReport, ModerationActionType, Operator, Origin, Sanction, SanctionKind,
    Subject,
};
use chrono::Utc;
use parking_lot::RwLock;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, warn};

/// A destination as seen from an inbound event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationInfo {
    pub id: u64,
    pub name: String,
    pub handle: Option<String>,
}

impl DestinationInfo {
    pub fn new(id: u64, name: impl Into<String>, handle: Option<String>) -> Self {
        Self {
            id,
            name: name.into(),
            handle,
        }
    }

    fn label(&self) -> String {
        match &self.handle {
            Some(handle) => format!("{} ({handle})", self.name),
            None => self.name.clone(),
        }
    }
}

fn timestamp() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn origin_label(origin: &Origin) -> String {
    match origin.destination {
        Some(_) if !origin.name.is_empty() => origin.name.clone(),
        Some(id) => id.to_string(),
        None => "private channel".to_string(),
    }
}

fn fan_out_line(report: &FanOutReport) -> String {
    if report.failed.is_empty() {
        format!("Destinations: {}", report.succeeded.len())
    } else {
        format!(
            "Destinations: {} ok, {} failed",
            report.succeeded.len(),
            report.failed.len()
        )
    }
}

/// Sends operator-facing messages through the chat transport
pub struct Notifier {
    transport: Arc<dyn ChatTransport>,
    /// Channel id, not the group hosting it
    channel: RwLock<Option<u64>>,
    roots: Vec<u64>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("roots", &self.roots)
            .field("channel", &self.channel())
            .finish_non_exhaustive()
    }
}

impl Notifier {
    #[must_use]
    pub fn new(transport: Arc<dyn ChatTransport>, roots: impl IntoIterator<Item = u64>) -> Self {
        Self {
            transport,
            channel: RwLock::new(None),
            roots: roots.into_iter().collect(),
        }
    }

    pub fn set_channel(&self, channel: u64) {
        *self.channel.write() = Some(channel);
    }

    #[must_use]
    pub fn channel(&self) -> Option<u64> {
        *self.channel.read()
    }

    async fn to_notification_channel(&self, kind: &str, text: &str) {
        let Some(channel) = self.channel() else {
            debug!(kind, "No notification channel set, skipping");
            return;
        };
        if let Err(e) = self.transport.send_message(channel, text).await {
            warn!(kind, channel, error = %e, "Failed to send notification");
        }
    }

    async fn to_user(&self, kind: &str, user: u64, text: &str) {
        if let Err(e) = self.transport.send_direct_message(user, text).await {
            warn!(kind, user, error = %e, "Failed to send direct message");
        }
    }

    pub async fn sanction_applied(&self, sanction: &Sanction, report: &FanOutReport) {
        let title = match sanction.kind {
            SanctionKind::Ban => "Member banned",
            SanctionKind::Mute => "Member muted",
        };
        let mut text = format!(
            "**{title}**\nMember: {} ({})\nFrom: {}\nDuration: {}\nReason: {}\nOperator: {} ({})\n{}",
            sanction.subject.display_name,
            sanction.subject.id,
            origin_label(&sanction.origin),
            format_duration(sanction.duration_secs.unwrap_or(0)),
            display_reason(&sanction.reason),
            sanction.operator.display_name,
            sanction.operator.id,
            fan_out_line(report),
        );
        if let Some(expire_at) = sanction.expire_at {
            let _ = write!(text, "\nExpires: {}", expire_at.format("%Y-%m-%d %H:%M:%S UTC"));
        }
        let _ = write!(text, "\nTime: {}", timestamp());

        self.to_notification_channel("sanction_applied", &text)
            .await;
    }

    pub async fn sanction_released(
        &self,
        kind: SanctionKind,
        subject: &Subject,
        operator: &Operator,
        reason: &str,
        report: Option<&FanOutReport>,
    ) {
        let title = match kind {
            SanctionKind::Ban => "Ban lifted",
            SanctionKind::Mute => "Mute lifted",
        };
        let by = if operator.is_system() {
            "automatic".to_string()
        } else {
            format!("{} ({})", operator.display_name, operator.id)
        };
        let mut text = format!(
            "**{title}**\nMember: {} ({})\nReason: {}\nBy: {by}",
            subject.display_name,
            subject.id,
            display_reason(reason),
        );
        if let Some(report) = report {
            let _ = write!(text, "\n{}", fan_out_line(report));
        }
        let _ = write!(text, "\nTime: {}", timestamp());

        self.to_notification_channel("sanction_released", &text)
            .await;
    }

    pub async fn kicked(
        &self,
        subject: &Subject,
        origin: &Origin,
        operator: &Operator,
        report: &FanOutReport,
    ) {
        let text = format!(
            "**Member kicked**\nMember: {} ({})\nFrom: {}\nOperator: {} ({})\n{}\nTime: {}",
            subject.display_name,
            subject.id,
            origin_label(origin),
            operator.display_name,
            operator.id,
            fan_out_line(report),
            timestamp(),
        );
        self.to_notification_channel("kicked", &text).await;
    }

    pub async fn operation_failed(
        &self,
        action: ModerationActionType,
        subject: &Subject,
        operator: &Operator,
        error: &str,
    ) {
        let text = format!(
            "**Operation failed**\nAction: {action}\nMember: {} ({})\nOperator: {} ({})\nError: {error}\nTime: {}",
            subject.display_name,
            subject.id,
            operator.display_name,
            operator.id,
            timestamp(),
        );
        self.to_notification_channel("operation_failed", &text)
            .await;
    }

    /// Tell every root operator the bot is leaving an unauthorized destination
    pub async fn unauthorized_destination(&self, destination: &DestinationInfo) {
        let text = format!(
            "**Unauthorized destination detected**\nDestination: {}\nID: {}\nThe bot will leave it.",
            destination.label(),
            destination.id,
        );
        for root in &self.roots {
            self.to_user("unauthorized_destination", *root, &text)
                .await;
        }
    }

    /// Tell one root operator they are in an unauthorized destination
    pub async fn root_present(&self, root: u64, destination: &DestinationInfo) {
        let text = format!(
            "**Warning: you are in an unauthorized destination**\nDestination: {}\nID: {}\nThe bot stays because you are present. Use /authorize to manage it.",
            destination.label(),
            destination.id,
        );
        self.to_user("root_present", root, &text).await;
    }

    /// Announce in `destination` that a banned member was removed on join
    pub async fn banned_member_removed(&self, destination: u64, subject: &Subject) {
        let text = format!(
            "{} ({}) is banned and was removed automatically.",
            subject.display_name, subject.id
        );
        if let Err(e) = self.transport.send_message(destination, &text).await {
            warn!(destination, subject = subject.id, error = %e, "Failed to announce removal");
        }
    }
}

fn display_reason(reason: &str) -> &str {
    if reason.is_empty() { "none given" } else { reason }
}
