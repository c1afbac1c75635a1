use crate::{
    command::{interpret, Command},
    heater::TeapotEngine,
    messages::{self, RESTARTING, UNAUTHORIZED},
    ports::HeaterOutput,
    telegram::{BotSession, BotTransport, Inbound, TelegramError},
    types::DeviceVitals,
};

/// Replies for one command, plus whether the platform should reboot after
/// delivering them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dispatch {
    pub replies: Vec<String>,
    pub restart: bool,
}

pub fn dispatch<H: HeaterOutput>(
    engine: &mut TeapotEngine<H>,
    command: &Command,
    vitals: &DeviceVitals,
) -> Dispatch {
    let events = match command {
        Command::Help => return reply(messages::welcome_text(engine.config())),
        Command::Status => return reply(messages::status_text(&engine.status(), vitals)),
        Command::Restart => {
            return Dispatch {
                replies: vec![RESTARTING.to_string()],
                restart: true,
            }
        }
        Command::Unknown(text) => return reply(messages::invalid_command_text(text)),
        Command::Hot => engine.request_hot(i32::from(engine.config().default_hot_target)),
        Command::Termo => engine.request_termo(i32::from(engine.config().default_termo_target)),
        Command::Off => engine.request_off(),
        Command::SetHot(target) => engine.request_hot(*target),
        Command::SetTermo(target) => engine.request_termo(*target),
    };

    Dispatch {
        replies: events.iter().map(messages::event_text).collect(),
        restart: false,
    }
}

fn reply(text: String) -> Dispatch {
    Dispatch {
        replies: vec![text],
        restart: false,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteOutcome {
    pub processed: usize,
    pub rejected: usize,
    pub failed_replies: usize,
    pub restart: bool,
}

/// One polling round: drains every pending update, oldest first. The
/// checkpoint is advanced before each command is applied. Returns early on
/// `/restart` so the caller can persist the checkpoint and reboot.
///
/// A fetch failure aborts the round with the error. The first failed reply
/// ends the round too, leaving the remaining updates for the next round, so a
/// stalled link costs at most one fetch and one send per round.
pub fn poll_remote<T, H>(
    session: &mut BotSession,
    transport: &mut T,
    engine: &mut TeapotEngine<H>,
    vitals: &DeviceVitals,
) -> Result<RemoteOutcome, TelegramError>
where
    T: BotTransport + ?Sized,
    H: HeaterOutput,
{
    let mut outcome = RemoteOutcome::default();

    loop {
        let updates = transport.get_updates(session.next_offset())?;
        if updates.is_empty() {
            return Ok(outcome);
        }

        for update in updates {
            match session.accept(update) {
                None => {}
                Some(Inbound::Rejected { chat_id }) => {
                    outcome.rejected += 1;
                    if transport.send_message(&chat_id, UNAUTHORIZED).is_err() {
                        outcome.failed_replies += 1;
                        return Ok(outcome);
                    }
                }
                Some(Inbound::Authorized { text }) => {
                    let result = dispatch(engine, &interpret(&text), vitals);
                    outcome.processed += 1;
                    let delivered = result
                        .replies
                        .iter()
                        .all(|text| session.notify(&mut *transport, text).is_ok());
                    if !delivered {
                        outcome.failed_replies += 1;
                    }
                    if result.restart {
                        outcome.restart = true;
                        return Ok(outcome);
                    }
                    if !delivered {
                        return Ok(outcome);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::{
        config::TeapotConfig,
        ports::OutputError,
        telegram::{Chat, Message, Update},
        types::Mode,
    };
    use pretty_assertions::assert_eq;

    #[derive(Debug, Default)]
    struct NullHeater;

    impl HeaterOutput for NullHeater {
        fn set_heater(&mut self, _on: bool) -> Result<(), OutputError> {
            Ok(())
        }
    }

    /// Serves queued batches honouring the requested offset, and records sends.
    #[derive(Debug, Default)]
    struct ScriptedTransport {
        pending: VecDeque<Update>,
        offsets: Vec<i64>,
        sent: Vec<(String, String)>,
        send_attempts: usize,
        fail_sends: bool,
        fail_fetch: bool,
    }

    impl ScriptedTransport {
        fn with_messages(messages: &[(i64, i64, &str)]) -> Self {
            Self {
                pending: messages
                    .iter()
                    .map(|(update_id, chat, text)| Update {
                        update_id: *update_id,
                        message: Some(Message {
                            chat: Chat { id: *chat },
                            text: Some(text.to_string()),
                        }),
                    })
                    .collect(),
                ..Self::default()
            }
        }

        fn texts(&self) -> Vec<&str> {
            self.sent.iter().map(|(_, text)| text.as_str()).collect()
        }
    }

    impl BotTransport for ScriptedTransport {
        fn get_updates(&mut self, offset: i64) -> Result<Vec<Update>, TelegramError> {
            if self.fail_fetch {
                return Err(TelegramError::Transport("offline".to_string()));
            }
            self.offsets.push(offset);
            self.pending.retain(|update| update.update_id >= offset);
            // Two per batch to exercise the refetch loop.
            Ok(self.pending.iter().take(2).cloned().collect())
        }

        fn send_message(&mut self, chat_id: &str, text: &str) -> Result<(), TelegramError> {
            self.send_attempts += 1;
            if self.fail_sends {
                return Err(TelegramError::Status(502));
            }
            self.sent.push((chat_id.to_string(), text.to_string()));
            Ok(())
        }
    }

    fn engine() -> TeapotEngine<NullHeater> {
        TeapotEngine::new(TeapotConfig::default(), NullHeater)
    }

    #[test]
    fn hot_command_starts_boil() {
        let mut engine = engine();
        engine.tick(20);

        let result = dispatch(&mut engine, &Command::Hot, &DeviceVitals::default());

        assert_eq!(result.replies, vec!["Set HOT mode to 100 C".to_string()]);
        assert!(!result.restart);
        assert_eq!(engine.mode(), Mode::Hot(100));
    }

    #[test]
    fn empty_termo_suffix_is_rejected() {
        let mut engine = engine();
        engine.tick(20);
        engine.request_hot(90);

        let result = dispatch(&mut engine, &interpret("/t"), &DeviceVitals::default());

        assert_eq!(result.replies, vec!["Invalid TERMO value".to_string()]);
        assert_eq!(engine.mode(), Mode::Hot(90));
    }

    #[test]
    fn termo_above_target_replies_twice() {
        let mut engine = engine();
        engine.tick(90);

        let result = dispatch(&mut engine, &Command::SetTermo(50), &DeviceVitals::default());

        assert_eq!(
            result.replies,
            vec![
                "Current temp above requested".to_string(),
                "Set TERMO mode to 50 C".to_string()
            ]
        );
    }

    #[test]
    fn status_and_unknown_replies() {
        let mut engine = engine();
        engine.tick(31);
        let vitals = DeviceVitals {
            ip: "10.0.0.2".to_string(),
            rssi_dbm: -70,
            free_heap_bytes: 1_000,
        };

        let status = dispatch(&mut engine, &Command::Status, &vitals);
        assert!(status.replies[0].contains("IP: 10.0.0.2"));
        assert!(status.replies[0].ends_with("Current temp: 31 C"));

        let unknown = dispatch(
            &mut engine,
            &Command::Unknown("boil".to_string()),
            &vitals,
        );
        assert_eq!(unknown.replies, vec!["Invalid command: boil".to_string()]);
    }

    #[test]
    fn drains_all_batches_and_advances_checkpoint() {
        let mut engine = engine();
        engine.tick(20);
        let mut session = BotSession::new("42").resume_from(Some(9));
        let mut transport = ScriptedTransport::with_messages(&[
            (10, 42, "/t60"),
            (11, 42, "/status"),
            (12, 42, "/off"),
        ]);

        let outcome =
            poll_remote(&mut session, &mut transport, &mut engine, &DeviceVitals::default())
                .unwrap();

        assert_eq!(outcome.processed, 3);
        assert!(!outcome.restart);
        assert_eq!(session.last_message_received(), 12);
        assert_eq!(transport.offsets, vec![10, 12, 13]);
        assert_eq!(engine.mode(), Mode::Off);
        assert_eq!(transport.texts()[0], "Set TERMO mode to 60 C");
        assert_eq!(transport.texts().last(), Some(&"All modes are OFF"));
    }

    #[test]
    fn foreign_chats_are_rejected_without_state_change() {
        let mut engine = engine();
        let mut session = BotSession::new("42");
        let mut transport = ScriptedTransport::with_messages(&[(1, 666, "/hot")]);

        let outcome =
            poll_remote(&mut session, &mut transport, &mut engine, &DeviceVitals::default())
                .unwrap();

        assert_eq!(outcome.rejected, 1);
        assert_eq!(outcome.processed, 0);
        assert_eq!(engine.mode(), Mode::Off);
        assert_eq!(
            transport.sent,
            vec![(
                "666".to_string(),
                "Sorry, you are not authorized to use this bot.".to_string()
            )]
        );
        assert_eq!(session.last_message_received(), 1);
    }

    #[test]
    fn restart_stops_the_round() {
        let mut engine = engine();
        engine.tick(20);
        let mut session = BotSession::new("42");
        let mut transport = ScriptedTransport::with_messages(&[
            (5, 42, "/restart"),
            (6, 42, "/hot"),
        ]);

        let outcome =
            poll_remote(&mut session, &mut transport, &mut engine, &DeviceVitals::default())
                .unwrap();

        assert!(outcome.restart);
        assert_eq!(session.last_message_received(), 5);
        assert_eq!(transport.texts(), vec!["Restarting..."]);
        assert_eq!(engine.mode(), Mode::Off);
    }

    #[test]
    fn failed_reply_ends_the_round() {
        let mut engine = engine();
        engine.tick(20);
        let mut session = BotSession::new("42");
        let mut transport = ScriptedTransport::with_messages(&[
            (1, 42, "/hot"),
            (2, 42, "/status"),
            (3, 42, "/off"),
            (4, 666, "/hot"),
        ]);
        transport.fail_sends = true;

        let outcome =
            poll_remote(&mut session, &mut transport, &mut engine, &DeviceVitals::default())
                .unwrap();

        assert_eq!(outcome.processed, 1);
        assert_eq!(outcome.failed_replies, 1);
        assert_eq!(transport.offsets, vec![1]);
        assert_eq!(transport.send_attempts, 1);
        assert_eq!(session.last_message_received(), 1);
        assert_eq!(engine.mode(), Mode::Hot(100));
    }

    #[test]
    fn remaining_updates_are_served_next_round() {
        let mut engine = engine();
        engine.tick(20);
        let mut session = BotSession::new("42");
        let mut transport = ScriptedTransport::with_messages(&[(1, 42, "/hot"), (2, 42, "/off")]);
        transport.fail_sends = true;
        poll_remote(&mut session, &mut transport, &mut engine, &DeviceVitals::default()).unwrap();

        transport.fail_sends = false;
        let outcome =
            poll_remote(&mut session, &mut transport, &mut engine, &DeviceVitals::default())
                .unwrap();

        assert_eq!(outcome.processed, 1);
        assert_eq!(session.last_message_received(), 2);
        assert_eq!(engine.mode(), Mode::Off);
        assert_eq!(transport.texts(), vec!["All modes are OFF"]);
    }

    #[test]
    fn restart_survives_a_failed_reply() {
        let mut engine = engine();
        let mut session = BotSession::new("42");
        let mut transport = ScriptedTransport::with_messages(&[(7, 42, "/restart")]);
        transport.fail_sends = true;

        let outcome =
            poll_remote(&mut session, &mut transport, &mut engine, &DeviceVitals::default())
                .unwrap();

        assert!(outcome.restart);
        assert_eq!(outcome.failed_replies, 1);
        assert_eq!(session.last_message_received(), 7);
    }

    #[test]
    fn fetch_failure_is_returned() {
        let mut engine = engine();
        let mut session = BotSession::new("42").resume_from(Some(3));
        let mut transport = ScriptedTransport {
            fail_fetch: true,
            ..ScriptedTransport::default()
        };

        let err = poll_remote(&mut session, &mut transport, &mut engine, &DeviceVitals::default())
            .unwrap_err();

        assert!(matches!(err, TelegramError::Transport(_)));
        assert_eq!(session.last_message_received(), 3);
    }
}
