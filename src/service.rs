//! One chat request end to end: select keys, fail over, relay the stream.

use futures_util::stream::BoxStream;
use tracing::{error, info};

use crate::chat::{ChatRequest, ModelAliases, PreparedChat};
use crate::dispatch::Dispatcher;
use crate::relay::{DISPATCH_FAILED_MESSAGE, RelayEvent, RelayLimits, error_events, relay_response};
use crate::selector::KeySelector;
use crate::Result;

#[derive(Clone, Debug)]
pub struct RelayService {
    selector: KeySelector,
    dispatcher: Dispatcher,
    aliases: ModelAliases,
    limits: RelayLimits,
}

impl RelayService {
    pub fn new(selector: KeySelector, dispatcher: Dispatcher) -> Self {
        Self {
            selector,
            dispatcher,
            aliases: ModelAliases::default(),
            limits: RelayLimits::default(),
        }
    }

    pub fn with_aliases(mut self, aliases: ModelAliases) -> Self {
        self.aliases = aliases;
        self
    }

    pub fn with_limits(mut self, limits: RelayLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn selector(&self) -> &KeySelector {
        &self.selector
    }

    pub fn pool_size(&self) -> usize {
        self.selector.pool().len()
    }

    /// Validates the request. Runs before any key is selected, so rejected
    /// requests never advance the rotation counter.
    pub fn prepare(&self, request: ChatRequest) -> Result<PreparedChat> {
        request.prepare(&self.aliases)
    }

    /// Never fails: selection, storage or exhaustion failures become a
    /// stream holding a single error event.
    pub async fn stream_chat(&self, chat: PreparedChat) -> BoxStream<'static, RelayEvent> {
        let selection = match self.selector.select().await {
            Ok(selection) => selection,
            Err(err) => {
                error!(error = %err, "key selection failed");
                return error_events(DISPATCH_FAILED_MESSAGE);
            }
        };

        match self
            .dispatcher
            .dispatch(&chat.model, &chat.envelope, &selection)
            .await
        {
            Ok(dispatched) => {
                info!(
                    model = %chat.model,
                    key = %dispatched.key,
                    attempts = dispatched.attempts(),
                    "relaying upstream stream"
                );
                relay_response(dispatched.response, self.limits)
            }
            Err(err) => {
                error!(error = %err, model = %chat.model, "chat request failed");
                error_events(DISPATCH_FAILED_MESSAGE)
            }
        }
    }
}
