//! Telegram Bot API wire format and the transport seam.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

pub const API_BASE_URL: &str = "https://api.telegram.org";
/// Upper bound on updates fetched per request, keeps response bodies small.
pub const UPDATES_LIMIT: u32 = 10;

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("bot api returned http {0}")]
    Status(u16),
    #[error("bot api rejected request: {0}")]
    Api(String),
    #[error("malformed bot api payload: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Message {
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Serialize)]
pub struct SendMessage<'a> {
    pub chat_id: &'a str,
    pub text: &'a str,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

/// Blocking Bot API client. Implemented over `ureq` on the host and over the
/// ESP-IDF HTTP client on the device.
pub trait BotTransport {
    fn get_updates(&mut self, offset: i64) -> Result<Vec<Update>, TelegramError>;
    fn send_message(&mut self, chat_id: &str, text: &str) -> Result<(), TelegramError>;
}

pub fn get_updates_url(token: &str, offset: i64) -> String {
    format!("{API_BASE_URL}/bot{token}/getUpdates?offset={offset}&limit={UPDATES_LIMIT}&timeout=0")
}

pub fn send_message_url(token: &str) -> String {
    format!("{API_BASE_URL}/bot{token}/sendMessage")
}

pub fn send_message_body(chat_id: &str, text: &str) -> Result<Vec<u8>, TelegramError> {
    Ok(serde_json::to_vec(&SendMessage { chat_id, text })?)
}

fn parse_envelope<T: DeserializeOwned>(body: &[u8]) -> Result<Option<T>, TelegramError> {
    let envelope: Envelope<T> = serde_json::from_slice(body)?;
    if !envelope.ok {
        return Err(TelegramError::Api(
            envelope
                .description
                .unwrap_or_else(|| "unknown error".to_string()),
        ));
    }
    Ok(envelope.result)
}

pub fn parse_updates(body: &[u8]) -> Result<Vec<Update>, TelegramError> {
    Ok(parse_envelope::<Vec<Update>>(body)?.unwrap_or_default())
}

pub fn check_send_response(body: &[u8]) -> Result<(), TelegramError> {
    parse_envelope::<serde_json::Value>(body).map(|_| ())
}

/// An update after the authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Authorized { text: String },
    Rejected { chat_id: String },
}

/// The authorized chat and the last processed update id.
#[derive(Debug, Clone)]
pub struct BotSession {
    chat_id: String,
    last_message_received: i64,
}

impl BotSession {
    pub fn new(chat_id: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            last_message_received: 0,
        }
    }

    pub fn resume_from(mut self, checkpoint: Option<i64>) -> Self {
        if let Some(id) = checkpoint {
            self.last_message_received = id;
        }
        self
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn last_message_received(&self) -> i64 {
        self.last_message_received
    }

    pub fn next_offset(&self) -> i64 {
        self.last_message_received.saturating_add(1)
    }

    /// Advances the checkpoint to this update and classifies it. Updates that
    /// carry no message yield `None`.
    pub fn accept(&mut self, update: Update) -> Option<Inbound> {
        self.last_message_received = update.update_id;
        let message = update.message?;

        let chat_id = message.chat.id.to_string();
        if chat_id == self.chat_id {
            Some(Inbound::Authorized {
                text: message.text.unwrap_or_default(),
            })
        } else {
            Some(Inbound::Rejected { chat_id })
        }
    }

    pub fn notify<T: BotTransport + ?Sized>(
        &self,
        transport: &mut T,
        text: &str,
    ) -> Result<(), TelegramError> {
        transport.send_message(&self.chat_id, text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn urls() {
        assert_eq!(
            get_updates_url("123:abc", 5),
            "https://api.telegram.org/bot123:abc/getUpdates?offset=5&limit=10&timeout=0"
        );
        assert_eq!(
            send_message_url("123:abc"),
            "https://api.telegram.org/bot123:abc/sendMessage"
        );
    }

    #[test]
    fn send_body_is_json() {
        let body = send_message_body("42", "Hot complete").unwrap();
        assert_eq!(
            String::from_utf8(body).unwrap(),
            r#"{"chat_id":"42","text":"Hot complete"}"#
        );
    }

    #[test]
    fn parses_update_batch() {
        let body = br#"{"ok":true,"result":[
            {"update_id":7,"message":{"message_id":1,"chat":{"id":42,"type":"private"},"text":"/hot"}},
            {"update_id":8,"edited_message":{"message_id":1}},
            {"update_id":9,"message":{"message_id":2,"chat":{"id":42},"sticker":{}}}
        ]}"#;

        let updates = parse_updates(body).unwrap();

        assert_eq!(updates.len(), 3);
        assert_eq!(
            updates[0].message,
            Some(Message {
                chat: Chat { id: 42 },
                text: Some("/hot".to_string())
            })
        );
        assert_eq!(updates[1].message, None);
        assert_eq!(updates[2].message.as_ref().and_then(|m| m.text.clone()), None);
    }

    #[test]
    fn api_failure_carries_description() {
        let err = parse_updates(br#"{"ok":false,"error_code":401,"description":"Unauthorized"}"#)
            .unwrap_err();
        assert!(matches!(err, TelegramError::Api(ref d) if d == "Unauthorized"));

        assert!(matches!(
            check_send_response(b"<html>"),
            Err(TelegramError::Json(_))
        ));
        assert!(check_send_response(br#"{"ok":true,"result":{"message_id":3}}"#).is_ok());
    }

    #[test]
    fn session_checks_chat_and_advances() {
        let mut session = BotSession::new("42").resume_from(Some(100));
        assert_eq!(session.next_offset(), 101);

        let inbound = session.accept(Update {
            update_id: 101,
            message: Some(Message {
                chat: Chat { id: 7 },
                text: Some("/off".to_string()),
            }),
        });
        assert_eq!(
            inbound,
            Some(Inbound::Rejected {
                chat_id: "7".to_string()
            })
        );
        assert_eq!(session.last_message_received(), 101);

        let inbound = session.accept(Update {
            update_id: 102,
            message: Some(Message {
                chat: Chat { id: 42 },
                text: None,
            }),
        });
        assert_eq!(
            inbound,
            Some(Inbound::Authorized {
                text: String::new()
            })
        );

        assert_eq!(
            session.accept(Update {
                update_id: 103,
                message: None
            }),
            None
        );
        assert_eq!(session.next_offset(), 104);
    }

    #[test]
    fn missing_checkpoint_starts_at_zero() {
        let session = BotSession::new("42").resume_from(None);
        assert_eq!(session.last_message_received(), 0);
        assert_eq!(session.next_offset(), 1);
    }
}
