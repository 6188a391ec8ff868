// ============================================================================
// Channel adapters: the opaque delivery integrations behind a send contract
// ============================================================================

pub mod email;
pub mod push;
pub mod sms;

pub use email::SmtpAdapter;
pub use push::PushAdapter;
pub use sms::SmsAdapter;

use async_trait::async_trait;

use crate::error::DispatchResult;
use crate::model::Channel;
use crate::queue::Job;
use crate::resolver::Recipient;
use crate::template::RenderedContent;

/// Delivery contract implemented per channel.
///
/// Implementations distinguish transient failures (`AdapterTransient`,
/// queue retry applies) from permanent ones (`AdapterPermanent`, job is
/// buried without retry).
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel(&self) -> Channel;

    async fn deliver(
        &self,
        job: &Job,
        recipient: &Recipient,
        content: &RenderedContent,
    ) -> DispatchResult<()>;
}
