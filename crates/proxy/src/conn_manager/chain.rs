//! Decoder and encoder filter iteration over the message slab.

use codec::MessageType;
use tracing::{debug, trace, warn};

use super::callbacks::{self, MessageCallbacks};
use super::{Core, LOG_TARGET};
use crate::filter::{
    DecoderFilter, DecoderFilterCallbacks, FilterEvent, FilterIterationStartState, FilterStatus,
};
use crate::message::{FilterHandle, MessageHandle};

impl Core {
    /// Runs `f` on the decoder filter at `target` with callbacks bound to its
    /// message. Returns `None` when the message or the filter is gone, else the
    /// result and whether the filter asked to continue decoding.
    fn invoke_decoder_filter<R, F>(&mut self, target: FilterHandle, f: F) -> Option<(R, bool)>
    where
        F: FnOnce(&mut dyn DecoderFilter, &mut dyn DecoderFilterCallbacks) -> R,
    {
        let Self {
            shared, messages, ..
        } = self;
        let message = messages.get_mut(target.message)?;
        let mut filter = message.decoder_filters.get_mut(target.index)?.take()?;
        let (result, resume) = {
            let mut callbacks = MessageCallbacks::new(shared, message, target);
            let result = f(filter.as_mut(), &mut callbacks);
            (result, callbacks.resume_requested())
        };
        let reset = message.reset_requested;
        if let Some(slot) = message.decoder_filters.get_mut(target.index) {
            *slot = Some(filter);
        }
        if reset {
            trace!(target: LOG_TARGET, stream_id = message.stream_id, "stream reset by filter");
            messages.mark_deleted(target.message);
        }
        Some((result, resume))
    }

    /// Runs decoder filters from `start`. A local reply ends iteration with
    /// `ContinueIteration`; a message deleted by a filter ends it with
    /// `AbortIteration`.
    fn apply_decoder_filters(&mut self, handle: MessageHandle, start: usize) -> FilterStatus {
        let mut index = start;
        loop {
            let Some(message) = self.messages.get(handle) else {
                return FilterStatus::AbortIteration;
            };
            if message.local_response_sent || index >= message.decoder_filters.len() {
                return FilterStatus::ContinueIteration;
            }
            let target = FilterHandle {
                message: handle,
                index,
            };
            // Continue requests made while the chain itself is running are
            // implied by the returned status.
            let status = self
                .invoke_decoder_filter(target, |filter, callbacks| {
                    filter.on_message_decoded(callbacks)
                })
                .map_or(FilterStatus::ContinueIteration, |(status, _)| status);
            let Some(message) = self.messages.get(handle) else {
                return FilterStatus::AbortIteration;
            };
            if message.local_response_sent {
                return FilterStatus::ContinueIteration;
            }
            if status != FilterStatus::ContinueIteration {
                trace!(target: LOG_TARGET, stream_id = message.stream_id, index, ?status, "decoder chain stopped");
                return status;
            }
            index += 1;
        }
    }

    /// A message finished decoding.
    pub(super) fn on_message_decoded(&mut self, handle: MessageHandle) {
        self.shared.stats.request_decoding_success.inc();
        let Some(message) = self.messages.get_mut(handle) else {
            return;
        };
        let message_type = message.metadata.message_type();
        if message_type.is_stream_frame() {
            let metadata = std::mem::take(&mut message.metadata);
            self.messages.mark_deleted(handle);
            self.shared.streams.on_client_frame(metadata);
            return;
        }
        if !matches!(
            message_type,
            MessageType::Request | MessageType::Oneway | MessageType::StreamInit
        ) {
            warn!(target: LOG_TARGET, message_type = message_type.as_str(), "unexpected message on the request path, dropping");
            self.messages.mark_deleted(handle);
            return;
        }

        match self.apply_decoder_filters(handle, 0) {
            FilterStatus::ContinueIteration => self.finalize_request(handle),
            FilterStatus::PauseIteration => {
                if let Some(message) = self.messages.get_mut(handle) {
                    debug!(target: LOG_TARGET, stream_id = message.stream_id, "decoding paused by filter");
                    message.pending_stream_decoded = true;
                    self.stopped = true;
                    self.paused = Some(handle);
                }
            }
            FilterStatus::AbortIteration | FilterStatus::Retry => {
                self.messages.mark_deleted(handle);
            }
        }
    }

    fn finalize_request(&mut self, handle: MessageHandle) {
        let Some(message) = self.messages.get_mut(handle) else {
            return;
        };
        message.pending_stream_decoded = false;
        let stats = &self.shared.stats;
        stats.request.inc();
        let one_way = match message.metadata.message_type() {
            MessageType::Request => {
                stats.request_twoway.inc();
                false
            }
            MessageType::Oneway => {
                stats.request_oneway.inc();
                true
            }
            _ => false,
        };
        debug!(
            target: LOG_TARGET,
            stream_id = message.stream_id,
            request_id = message.request_id(),
            one_way,
            local_reply = message.local_response_sent,
            "request finalized"
        );
        if message.local_response_sent || one_way {
            self.messages.mark_deleted(handle);
        }
    }

    /// Delivers an asynchronous event to a decoder filter. Returns whether the
    /// filter asked to continue decoding.
    pub(super) fn deliver_event(&mut self, target: FilterHandle, event: FilterEvent) -> bool {
        match self.invoke_decoder_filter(target, |filter, callbacks| {
            filter.on_event(event, callbacks);
        }) {
            Some(((), resume)) => resume,
            None => {
                trace!(target: LOG_TARGET, index = target.index, "event for a finished message dropped");
                false
            }
        }
    }

    /// Resumes the decoder chain of the message at `target` after the filter
    /// there asked to continue. Returns `true` once the message no longer
    /// holds up the connection.
    pub(super) fn continue_message(&mut self, target: FilterHandle) -> bool {
        let Some(message) = self.messages.get(target.message) else {
            return true;
        };
        if !message.pending_stream_decoded {
            trace!(target: LOG_TARGET, stream_id = message.stream_id, "continue on a message that is not paused");
            return false;
        }
        let state = if message.metadata.origin_message().is_empty() {
            FilterIterationStartState::AlwaysStartFromNext
        } else {
            FilterIterationStartState::CanStartFromCurrent
        };
        let start = match state {
            FilterIterationStartState::AlwaysStartFromNext => target.index + 1,
            FilterIterationStartState::CanStartFromCurrent => {
                warn!(target: LOG_TARGET, stream_id = message.stream_id, index = target.index, "message not consumed, resuming from the same filter");
                target.index
            }
        };
        match self.apply_decoder_filters(target.message, start) {
            FilterStatus::ContinueIteration => {
                self.finalize_request(target.message);
                true
            }
            FilterStatus::PauseIteration => {
                self.paused = Some(target.message);
                false
            }
            FilterStatus::AbortIteration | FilterStatus::Retry => {
                self.messages.mark_deleted(target.message);
                true
            }
        }
    }

    /// Resumes a response held by the encoder filter at `target`.
    pub(super) fn continue_encoding(&mut self, target: FilterHandle) {
        let Self {
            shared, messages, ..
        } = self;
        let Some(message) = messages.get_mut(target.message) else {
            return;
        };
        if !message.encoder_paused {
            return;
        }
        message.encoder_paused = false;
        let consumed = message
            .response
            .as_ref()
            .is_none_or(|(response, _)| response.origin_message().is_empty());
        let start = if consumed {
            target.index + 1
        } else {
            target.index
        };
        match callbacks::apply_encoder_filters(message, target.message, start) {
            FilterStatus::ContinueIteration => {
                callbacks::forward_response(shared, message);
            }
            FilterStatus::PauseIteration => message.encoder_paused = true,
            FilterStatus::AbortIteration | FilterStatus::Retry => {
                message.response = None;
                message.reset_requested = true;
            }
        }
        if message.reset_requested {
            messages.mark_deleted(target.message);
        }
    }
}
