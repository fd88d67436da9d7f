//! VIP envelope type
//!
//! A `Message` is the unit exchanged between an agent and the router. It is
//! built once (builder pattern) and treated as an immutable value afterwards;
//! the transport collaborator decides how it is encoded on the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol tag carried by every envelope unless overridden.
pub const DEFAULT_SIGNATURE: &str = "VIP1";

/// Well-known subsystem names.
pub mod subsystems {
    pub const HELLO: &str = "hello";
    pub const ERROR: &str = "error";
    pub const RPC: &str = "RPC";
    pub const PUBSUB: &str = "pubsub";
    pub const CONFIG: &str = "config.store";
    pub const AGENT_STOP: &str = "agentstop";
}

/// A VIP envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Identity of the peer this envelope is addressed to (empty = router)
    pub recipient: String,
    /// Identity of the peer that sent this envelope
    #[serde(default)]
    pub sender: String,
    /// Subsystem that must handle the envelope (e.g. "hello", "RPC")
    pub subsystem: String,
    /// Message id used to correlate requests and responses
    #[serde(default)]
    pub id: String,
    /// Authenticated user tag assigned by the router
    #[serde(default)]
    pub user_id: String,
    /// Protocol signature/version tag
    #[serde(default = "default_signature")]
    pub signature: String,
    /// Ordered, opaque arguments
    #[serde(default)]
    pub args: Vec<Value>,
}

fn default_signature() -> String {
    DEFAULT_SIGNATURE.to_string()
}

impl Message {
    /// Creates a new envelope addressed to `recipient` for `subsystem`.
    ///
    /// # Example
    /// ```
    /// use vipcore::vip::Message;
    ///
    /// let msg = Message::new("", "hello").with_id("connect.hello.0");
    /// assert_eq!(msg.subsystem, "hello");
    /// assert_eq!(msg.signature, "VIP1");
    /// ```
    pub fn new(recipient: &str, subsystem: &str) -> Self {
        Self {
            recipient: recipient.to_string(),
            sender: String::new(),
            subsystem: subsystem.to_string(),
            id: String::new(),
            user_id: String::new(),
            signature: default_signature(),
            args: Vec::new(),
        }
    }

    /// Sets the sender identity (builder pattern).
    pub fn with_sender(mut self, sender: &str) -> Self {
        self.sender = sender.to_string();
        self
    }

    /// Sets the message id (builder pattern).
    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    /// Sets the user/auth tag (builder pattern).
    pub fn with_user_id(mut self, user_id: &str) -> Self {
        self.user_id = user_id.to_string();
        self
    }

    /// Overrides the signature tag (builder pattern).
    pub fn with_signature(mut self, signature: &str) -> Self {
        self.signature = signature.to_string();
        self
    }

    /// Appends one argument (builder pattern).
    pub fn with_arg(mut self, arg: impl Into<Value>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Replaces all arguments (builder pattern).
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// Creates a response addressed back to the sender of `msg`, keeping its id.
    ///
    /// # Example
    /// ```
    /// use vipcore::vip::Message;
    ///
    /// let request = Message::new("agent-b", "RPC").with_sender("agent-a").with_id("7");
    /// let response = Message::reply_to(&request, "error");
    /// assert_eq!(response.recipient, "agent-a");
    /// assert_eq!(response.id, "7");
    /// ```
    pub fn reply_to(msg: &Message, subsystem: &str) -> Self {
        Self::new(&msg.sender, subsystem)
            .with_id(&msg.id)
            .with_sender(&msg.recipient)
    }

    /// Returns the first argument as a string, if it is one.
    pub fn first_arg_str(&self) -> Option<&str> {
        self.args.first().and_then(Value::as_str)
    }

    /// Returns argument `index` as a string, or an empty string.
    pub fn arg_string(&self, index: usize) -> String {
        match self.args.get(index) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_creation() {
        let msg = Message::new("platform.router", "pubsub");
        assert_eq!(msg.recipient, "platform.router");
        assert_eq!(msg.subsystem, "pubsub");
        assert!(msg.sender.is_empty());
        assert!(msg.id.is_empty());
        assert!(msg.args.is_empty());
        assert_eq!(msg.signature, DEFAULT_SIGNATURE);
    }

    #[test]
    fn test_message_builder() {
        let msg = Message::new("", "hello")
            .with_sender("agent-1")
            .with_id("connect.hello.3")
            .with_user_id("admin")
            .with_arg("hello");

        assert_eq!(msg.sender, "agent-1");
        assert_eq!(msg.id, "connect.hello.3");
        assert_eq!(msg.user_id, "admin");
        assert_eq!(msg.first_arg_str(), Some("hello"));
    }

    #[test]
    fn test_reply_to_swaps_peers() {
        let request = Message::new("agent-b", "bogus")
            .with_sender("agent-a")
            .with_id("42");
        let reply = Message::reply_to(&request, "error").with_args(vec![json!(93)]);
        assert_eq!(reply.recipient, "agent-a");
        assert_eq!(reply.sender, "agent-b");
        assert_eq!(reply.subsystem, "error");
        assert_eq!(reply.id, "42");
        assert_eq!(reply.args, vec![json!(93)]);
    }

    #[test]
    fn test_arg_string() {
        let msg = Message::new("", "hello").with_args(vec![json!("welcome"), json!(1.0), json!(null)]);
        assert_eq!(msg.arg_string(0), "welcome");
        assert_eq!(msg.arg_string(1), "1.0");
        assert_eq!(msg.arg_string(2), "");
        assert_eq!(msg.arg_string(9), "");
    }

    #[test]
    fn test_message_deserialize_defaults() {
        let msg: Message =
            serde_json::from_str(r#"{"recipient":"","subsystem":"hello","args":["hello"]}"#)
                .unwrap();
        assert_eq!(msg.signature, "VIP1");
        assert!(msg.sender.is_empty());
        assert_eq!(msg.first_arg_str(), Some("hello"));
    }
}
