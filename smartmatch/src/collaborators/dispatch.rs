use async_trait::async_trait;

use crate::invitation::InvitationData;

use super::NotificationDispatch;

/// Notification dispatch that only logs. Used when no delivery channel is wired in.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingDispatch;

#[async_trait]
impl NotificationDispatch for LoggingDispatch {
    async fn notify(&self, invitation: &InvitationData) -> anyhow::Result<()> {
        tracing::info!(
            provider_id = %invitation.provider_id,
            invitation_id = %invitation.id,
            booking_id = %invitation.booking_id,
            expires_at = %invitation.expires_at,
            "Invitation ready for delivery"
        );
        Ok(())
    }
}
