//! Concrete sessions for each backend channel.
//!
//! The tool and product-info monitors are the same state machine as the main
//! conversation, bound to their own endpoint, codec, log and timer.

use crate::codec::ToolEventCodec;
use crate::config::{Endpoint, EndpointResolver};
use crate::router::ConversationCodec;
use crate::session::Session;

pub type ConversationSession = Session<ConversationCodec>;
pub type ToolMonitor = Session<ToolEventCodec>;
pub type ProductInfoMonitor = Session<ToolEventCodec>;

pub fn conversation(resolver: EndpointResolver) -> ConversationSession {
    Session::new(Endpoint::Conversation, resolver, ConversationCodec::new())
}

pub fn tool_monitor(resolver: EndpointResolver) -> ToolMonitor {
    Session::new(Endpoint::Tools, resolver, ToolEventCodec::tools())
}

pub fn product_info_monitor(resolver: EndpointResolver) -> ProductInfoMonitor {
    Session::new(Endpoint::ProductInfo, resolver, ToolEventCodec::product_info())
}
