//! Per-inbound-message handling: trust the connection's own identity over whatever `src` the
//! client sent, mutate the [`Directory`] under its atomic operations, and compute the outbound
//! fan-out plan for the reactor to deliver.

use std::collections::HashSet;
use std::time::Instant;

use wire::{Command, ErrorKind, Message, RESERVED_NICK};

use crate::directory::{ConnectionId, Directory, LeaveError, RegisterError, RenameError};

/// A side effect the reactor must carry out after applying the outbound plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    None,
    /// `quit` succeeded; close this connection's socket once its echo is flushed.
    CloseConnection,
    /// `squit` succeeded; the whole server is going down.
    Shutdown,
}

pub struct DispatchResult {
    pub outbound: Vec<(ConnectionId, Message)>,
    pub effect: Effect,
}

impl DispatchResult {
    fn one(conn: ConnectionId, msg: Message) -> DispatchResult {
        DispatchResult {
            outbound: vec![(conn, msg)],
            effect: Effect::None,
        }
    }

    fn error(conn: ConnectionId, kind: ErrorKind, text: &str) -> DispatchResult {
        DispatchResult::one(conn, Message::error(kind, text))
    }

    fn many(outbound: Vec<(ConnectionId, Message)>) -> DispatchResult {
        DispatchResult {
            outbound,
            effect: Effect::None,
        }
    }
}

fn sorted_recipients(directory: &Directory, recipients: HashSet<ConnectionId>) -> Vec<ConnectionId> {
    let mut recipients: Vec<ConnectionId> = recipients.into_iter().collect();
    recipients.sort_by(|a, b| directory.nick_of(*a).cmp(&directory.nick_of(*b)));
    recipients
}

/// Every channel-or-self recipient for a connection's current memberships, used to fan out
/// `nick`, `leave`, and `quit` notifications without double-delivering to a connection that
/// shares more than one channel with the sender.
fn channel_and_self_recipients(directory: &Directory, conn: ConnectionId, channels: &[String]) -> Vec<ConnectionId> {
    let mut recipients = HashSet::new();
    recipients.insert(conn);
    for channel in channels {
        for member in directory.members_of(channel) {
            recipients.insert(member);
        }
    }
    sorted_recipients(directory, recipients)
}

/// Dispatches one already schema-valid command arriving on `conn`. `cmd`'s `src` field is
/// overridden with the connection's trusted identity before any handler runs, so a client can
/// never forge another identity's commands.
pub fn dispatch(directory: &mut Directory, conn: ConnectionId, mut cmd: Command, now: Instant) -> DispatchResult {
    let trusted_src = directory.nick_of(conn).unwrap_or("").to_string();

    if !matches!(cmd, Command::Nick { .. }) && trusted_src.is_empty() {
        return DispatchResult::error(conn, ErrorKind::BadNick, "no nickname registered yet");
    }

    cmd.set_src(&trusted_src);

    match cmd {
        Command::Nick { update, .. } => dispatch_nick(directory, conn, &trusted_src, update),
        Command::Quit { msg, .. } => dispatch_quit(directory, conn, &trusted_src, msg),
        Command::Squit { msg, .. } => dispatch_squit(directory, conn, &trusted_src, msg),
        Command::Join { channels, .. } => dispatch_join(directory, conn, &trusted_src, channels, now),
        Command::Leave { channels, msg, .. } => dispatch_leave(directory, conn, &trusted_src, channels, msg),
        Command::Channels { .. } => dispatch_channels(directory, conn),
        Command::Users { channels, .. } => dispatch_users(directory, conn, channels),
        Command::Msg { targets, msg, .. } => dispatch_msg(directory, conn, &trusted_src, targets, msg),
        Command::Ping { msg, .. } => DispatchResult::one(conn, Message::pong(RESERVED_NICK, msg)),
        Command::Pong { .. } => DispatchResult {
            outbound: Vec::new(),
            effect: Effect::None,
        },
    }
}

fn dispatch_nick(directory: &mut Directory, conn: ConnectionId, trusted_src: &str, update: String) -> DispatchResult {
    if trusted_src.is_empty() {
        return match directory.register(conn, &update) {
            Ok(()) => DispatchResult::one(conn, Message::nick("", update)),
            Err(RegisterError::BadNick) | Err(RegisterError::Reserved) => {
                DispatchResult::error(conn, ErrorKind::BadNick, "invalid nickname")
            }
            Err(RegisterError::NickInUse) => {
                DispatchResult::error(conn, ErrorKind::NickInUse, "nickname already in use")
            }
        };
    }

    match directory.rename(conn, &update) {
        Ok(old) => {
            let channels = directory.channels_of(conn);
            let recipients = channel_and_self_recipients(directory, conn, &channels);
            let notif = Message::nick(old, update);
            DispatchResult::many(recipients.into_iter().map(|r| (r, notif.clone())).collect())
        }
        Err(RenameError::BadNick) | Err(RenameError::Reserved) => {
            DispatchResult::error(conn, ErrorKind::BadNick, "invalid nickname")
        }
        Err(RenameError::NickInUse) => DispatchResult::error(conn, ErrorKind::NickInUse, "nickname already in use"),
    }
}

fn dispatch_quit(directory: &mut Directory, conn: ConnectionId, _trusted_src: &str, msg: String) -> DispatchResult {
    synthetic_quit(directory, conn, msg)
}

/// Produces a server-originated `quit` notification for every channel `conn` belonged to and
/// removes it from the Directory, exactly as an explicit client `quit` would. The reactor calls
/// this directly for connections that die some other way (socket reset, keep-alive timeout), so
/// the membership invariants are restored the same way regardless of why the connection is gone.
/// Works even for a connection that never finished registering a nickname.
pub fn synthetic_quit(directory: &mut Directory, conn: ConnectionId, msg: impl Into<String>) -> DispatchResult {
    let trusted_src = directory.nick_of(conn).unwrap_or(RESERVED_NICK).to_string();
    let channels = directory.channels_of(conn);
    let recipients = channel_and_self_recipients(directory, conn, &channels);
    directory.quit(conn);

    let notif = Message::quit(trusted_src, msg.into());
    DispatchResult {
        outbound: recipients.into_iter().map(|r| (r, notif.clone())).collect(),
        effect: Effect::CloseConnection,
    }
}

fn dispatch_squit(_directory: &mut Directory, conn: ConnectionId, trusted_src: &str, _msg: String) -> DispatchResult {
    // External connections can never hold the reserved identity (the Directory refuses to
    // register or rename anyone to it), so this branch only ever fires for a forged or
    // mistaken client request: squit from a non-privileged source is rejected rather than
    // silently ignored, so misuse is visible to the caller.
    let _ = trusted_src;
    DispatchResult::error(conn, ErrorKind::NonExist, "squit requires a privileged source")
}

fn dispatch_join(
    directory: &mut Directory,
    conn: ConnectionId,
    trusted_src: &str,
    channels: Vec<String>,
    now: Instant,
) -> DispatchResult {
    match directory.join(conn, &channels, now) {
        Ok(newly_joined) => {
            if newly_joined.is_empty() {
                return DispatchResult::many(Vec::new());
            }
            let recipients = channel_and_self_recipients(directory, conn, &newly_joined);
            let notif = Message::join(trusted_src, newly_joined);
            DispatchResult::many(recipients.into_iter().map(|r| (r, notif.clone())).collect())
        }
        Err(_bad_channel) => DispatchResult::error(conn, ErrorKind::BadChannel, "malformed channel name"),
    }
}

fn dispatch_leave(
    directory: &mut Directory,
    conn: ConnectionId,
    trusted_src: &str,
    channels: Vec<String>,
    msg: String,
) -> DispatchResult {
    // Snapshot recipients before mutating: once `leave` succeeds, `conn` (and possibly other
    // members) are no longer in these channels' member sets.
    let recipients = channel_and_self_recipients(directory, conn, &channels);

    match directory.leave(conn, &channels) {
        Ok(()) => {
            let notif = Message::leave(trusted_src, channels, msg);
            DispatchResult::many(recipients.into_iter().map(|r| (r, notif.clone())).collect())
        }
        Err(LeaveError::NonMember) => DispatchResult::error(conn, ErrorKind::NonMember, "not a member of that channel"),
        Err(LeaveError::BadChannel) => DispatchResult::error(conn, ErrorKind::BadChannel, "malformed channel name"),
    }
}

fn dispatch_channels(directory: &mut Directory, conn: ConnectionId) -> DispatchResult {
    DispatchResult::one(conn, Message::channels_reply(directory.list_channels()))
}

fn dispatch_users(directory: &mut Directory, conn: ConnectionId, channels: Vec<String>) -> DispatchResult {
    let mut outbound = Vec::new();
    for channel in channels {
        match directory.list_users(&channel) {
            Some(names) => {
                outbound.push((conn, Message::names_reply(channel.clone(), names)));
                outbound.push((conn, Message::names_reply(channel, Vec::new())));
            }
            None => outbound.push((conn, Message::error(ErrorKind::NonExist, format!("no such channel: {}", channel)))),
        }
    }
    DispatchResult::many(outbound)
}

fn dispatch_msg(
    directory: &mut Directory,
    conn: ConnectionId,
    trusted_src: &str,
    targets: Vec<String>,
    msg: String,
) -> DispatchResult {
    match directory.fanout_msg(conn, &targets) {
        Ok(recipients) => {
            let notif = Message::msg(trusted_src, targets, msg);
            DispatchResult::many(recipients.into_iter().map(|r| (r, notif.clone())).collect())
        }
        Err(crate::directory::FanoutError::NonExist) => {
            DispatchResult::error(conn, ErrorKind::NonExist, "unknown target")
        }
        Err(crate::directory::FanoutError::BadChannel) => {
            DispatchResult::error(conn, ErrorKind::BadChannel, "malformed target")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use wire::Message;

    fn setup() -> Directory {
        Directory::new()
    }

    fn register(directory: &mut Directory, conn: ConnectionId, nick: &str) {
        directory.admit(conn);
        let result = dispatch(directory, conn, Command::Nick { src: String::new(), update: nick.to_string() }, Instant::now());
        assert_eq!(result.effect, Effect::None);
    }

    #[test]
    fn registration_echoes_to_self_only() {
        let mut dir = setup();
        dir.admit(1);
        let result = dispatch(
            &mut dir,
            1,
            Command::Nick { src: "ignored".to_string(), update: "alice".to_string() },
            Instant::now(),
        );
        assert_eq!(result.outbound, vec![(1, Message::nick("", "alice"))]);
    }

    #[test]
    fn malformed_or_reserved_nick_is_rejected_at_dispatch_not_schema() {
        let mut dir = setup();
        dir.admit(1);

        let result = dispatch(
            &mut dir,
            1,
            Command::Nick { src: String::new(), update: "bad nick".to_string() },
            Instant::now(),
        );
        assert_eq!(
            result.outbound,
            vec![(1, Message::error(ErrorKind::BadNick, "invalid nickname"))]
        );

        let result = dispatch(
            &mut dir,
            1,
            Command::Nick { src: String::new(), update: RESERVED_NICK.to_string() },
            Instant::now(),
        );
        assert_eq!(
            result.outbound,
            vec![(1, Message::error(ErrorKind::BadNick, "invalid nickname"))]
        );
        assert_eq!(dir.connection_of(RESERVED_NICK), None);
    }

    #[test]
    fn nick_in_use_reports_error_and_does_not_mutate() {
        let mut dir = setup();
        register(&mut dir, 1, "alice");
        dir.admit(2);

        let result = dispatch(
            &mut dir,
            2,
            Command::Nick { src: String::new(), update: "alice".to_string() },
            Instant::now(),
        );
        assert_eq!(
            result.outbound,
            vec![(2, Message::error(ErrorKind::NickInUse, "nickname already in use"))]
        );
    }

    #[test]
    fn src_is_overridden_from_trusted_identity() {
        let mut dir = setup();
        register(&mut dir, 1, "alice");

        let result = dispatch(
            &mut dir,
            1,
            Command::Msg { src: "mallory".to_string(), targets: vec!["bob".to_string()], msg: "hi".to_string() },
            Instant::now(),
        );
        // bob doesn't exist, but the important thing is the error goes to the real sender (1),
        // proving the forged src never reached fanout resolution as the acting identity.
        assert_eq!(result.outbound.len(), 1);
        assert_eq!(result.outbound[0].0, 1);
    }

    #[test]
    fn join_notifies_all_members_including_sender() {
        let mut dir = setup();
        register(&mut dir, 1, "alice");
        register(&mut dir, 2, "bob");

        dispatch(&mut dir, 1, Command::Join { src: String::new(), channels: vec!["#lobby".to_string()] }, Instant::now());
        let result = dispatch(&mut dir, 2, Command::Join { src: String::new(), channels: vec!["#lobby".to_string()] }, Instant::now());

        let mut recipients: Vec<ConnectionId> = result.outbound.iter().map(|(c, _)| *c).collect();
        recipients.sort();
        assert_eq!(recipients, vec![1, 2]);
    }

    #[test]
    fn channel_message_does_not_echo_to_sender() {
        let mut dir = setup();
        register(&mut dir, 1, "alice");
        register(&mut dir, 2, "bob");
        dispatch(&mut dir, 1, Command::Join { src: String::new(), channels: vec!["#lobby".to_string()] }, Instant::now());
        dispatch(&mut dir, 2, Command::Join { src: String::new(), channels: vec!["#lobby".to_string()] }, Instant::now());

        let result = dispatch(
            &mut dir,
            1,
            Command::Msg { src: String::new(), targets: vec!["#lobby".to_string()], msg: "hi".to_string() },
            Instant::now(),
        );
        assert_eq!(result.outbound, vec![(2, Message::msg("alice", vec!["#lobby".to_string()], "hi"))]);
    }

    #[test]
    fn quit_closes_connection_and_notifies_channels() {
        let mut dir = setup();
        register(&mut dir, 1, "alice");
        register(&mut dir, 2, "bob");
        dispatch(&mut dir, 1, Command::Join { src: String::new(), channels: vec!["#lobby".to_string()] }, Instant::now());
        dispatch(&mut dir, 2, Command::Join { src: String::new(), channels: vec!["#lobby".to_string()] }, Instant::now());

        let result = dispatch(&mut dir, 1, Command::Quit { src: String::new(), msg: "bye".to_string() }, Instant::now());
        assert_eq!(result.effect, Effect::CloseConnection);

        let mut recipients: Vec<ConnectionId> = result.outbound.iter().map(|(c, _)| *c).collect();
        recipients.sort();
        assert_eq!(recipients, vec![1, 2]);
        assert_eq!(dir.connection_of("alice"), None);
    }

    #[test]
    fn squit_from_client_is_rejected() {
        let mut dir = setup();
        register(&mut dir, 1, "alice");

        let result = dispatch(&mut dir, 1, Command::Squit { src: String::new(), msg: "down".to_string() }, Instant::now());
        assert_eq!(result.effect, Effect::None);
        assert_eq!(
            result.outbound,
            vec![(1, Message::error(ErrorKind::NonExist, "squit requires a privileged source"))]
        );
    }

    #[test]
    fn users_reply_terminates_with_empty_sentinel() {
        let mut dir = setup();
        register(&mut dir, 1, "alice");
        dispatch(&mut dir, 1, Command::Join { src: String::new(), channels: vec!["#lobby".to_string()] }, Instant::now());

        let result = dispatch(
            &mut dir,
            1,
            Command::Users { src: String::new(), channels: vec!["#lobby".to_string()], client: true },
            Instant::now(),
        );
        assert_eq!(
            result.outbound,
            vec![
                (1, Message::names_reply("#lobby", vec!["alice".to_string()])),
                (1, Message::names_reply("#lobby", Vec::new())),
            ]
        );
    }

    #[test]
    fn commands_before_registration_are_rejected() {
        let mut dir = setup();
        dir.admit(1);

        let result = dispatch(&mut dir, 1, Command::Channels { src: String::new() }, Instant::now());
        assert_eq!(
            result.outbound,
            vec![(1, Message::error(ErrorKind::BadNick, "no nickname registered yet"))]
        );
    }

    #[test]
    fn synthetic_quit_works_for_an_unregistered_connection() {
        let mut dir = setup();
        dir.admit(1);

        let result = synthetic_quit(&mut dir, 1, "connection dropped");
        assert_eq!(result.effect, Effect::CloseConnection);
        assert_eq!(result.outbound, vec![(1, Message::quit(RESERVED_NICK, "connection dropped"))]);
    }

    #[test]
    fn synthetic_quit_notifies_channels_like_an_explicit_quit() {
        let mut dir = setup();
        register(&mut dir, 1, "alice");
        register(&mut dir, 2, "bob");
        dispatch(&mut dir, 1, Command::Join { src: String::new(), channels: vec!["#lobby".to_string()] }, Instant::now());
        dispatch(&mut dir, 2, Command::Join { src: String::new(), channels: vec!["#lobby".to_string()] }, Instant::now());

        let result = synthetic_quit(&mut dir, 1, "keep-alive timeout");
        let mut recipients: Vec<ConnectionId> = result.outbound.iter().map(|(c, _)| *c).collect();
        recipients.sort();
        assert_eq!(recipients, vec![1, 2]);
        assert_eq!(dir.connection_of("alice"), None);
    }
}
