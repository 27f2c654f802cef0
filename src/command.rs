//! Command builders and the wire-building contract

use std::fmt::Write as _;
use std::time::Duration;

use crate::event::{EventFormat, EventName};

/// What a [`Linger`] command does to the connection's close behavior once
/// the disconnect notice arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LingerDirective {
    /// Close as soon as the disconnect notice arrives.
    Disable,
    /// Defer the close this long after the disconnect notice.
    Delay(Duration),
    /// Never auto-close; the handler drains events and closes itself.
    Forever,
}

/// Anything that can produce the wire text of one ESL request.
///
/// `build_message` returns the request without the record terminator; the
/// transport appends it. Single-line commands must not contain newlines;
/// ESL is line-delimited and an embedded newline injects a second command.
/// Multi-line commands (`sendmsg`) delimit their body with `Content-Length`.
pub trait Command: Send + Sync {
    /// Wire text of the request, without the terminator.
    fn build_message(&self) -> String;

    /// [`Linger`] overrides this; the connection applies the directive to
    /// its close delay while serializing the command.
    fn linger_directive(&self) -> Option<LingerDirective> {
        None
    }

    /// One-line rendering for diagnostics. Commands carrying secrets
    /// override this to redact them.
    fn describe(&self) -> String {
        self.build_message()
            .lines()
            .next()
            .unwrap_or_default()
            .to_string()
    }
}

/// `auth <password>`, answering the inbound challenge.
#[derive(Clone)]
pub struct Auth {
    pub password: String,
}

impl Command for Auth {
    fn build_message(&self) -> String {
        format!("auth {}", self.password)
    }

    fn describe(&self) -> String {
        "auth [REDACTED]".to_string()
    }
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auth")
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// `exit`, asking the softswitch to end the session.
#[derive(Debug, Clone, Copy, Default)]
pub struct Exit;

impl Command for Exit {
    fn build_message(&self) -> String {
        "exit".to_string()
    }
}

/// `connect`, the first command on an outbound socket; the reply carries
/// the channel data as headers.
#[derive(Debug, Clone, Copy, Default)]
pub struct Connect;

impl Command for Connect {
    fn build_message(&self) -> String {
        "connect".to_string()
    }
}

/// `api <command> <arguments>` or, with `background`, `bgapi …`.
///
/// Foreground replies arrive as `api/response`; background replies return a
/// `Job-UUID` immediately and deliver the result later as a
/// `BACKGROUND_JOB` event.
#[derive(Debug, Clone, Default)]
pub struct Api {
    pub command: String,
    pub arguments: String,
    pub background: bool,
}

impl Command for Api {
    fn build_message(&self) -> String {
        let verb = if self.background { "bgapi" } else { "api" };
        if self.arguments.is_empty() {
            format!("{} {}", verb, self.command)
        } else {
            format!("{} {} {}", verb, self.command, self.arguments)
        }
    }
}

/// `event <format> <names...>`, subscribing to events.
#[derive(Debug, Clone)]
pub struct Events {
    pub format: EventFormat,
    pub listen: Vec<String>,
}

impl Events {
    /// Subscribe to the given names in the given format.
    pub fn new(format: EventFormat, listen: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            format,
            listen: listen
                .into_iter()
                .map(Into::into)
                .collect(),
        }
    }

    /// Subscribe to typed event names.
    pub fn typed(format: EventFormat, names: &[EventName]) -> Self {
        Self {
            format,
            listen: names
                .iter()
                .map(|name| {
                    name.as_str()
                        .to_string()
                })
                .collect(),
        }
    }
}

impl Command for Events {
    fn build_message(&self) -> String {
        format!("event {} {}", self.format, self.listen.join(" "))
    }
}

/// `myevents [<uuid>] <format>`, subscribing to one session's events.
/// Outbound sockets omit the uuid; the session is already attached.
#[derive(Debug, Clone)]
pub struct MyEvents {
    pub format: EventFormat,
    pub uuid: Option<String>,
}

impl Command for MyEvents {
    fn build_message(&self) -> String {
        match &self.uuid {
            Some(uuid) => format!("myevents {} {}", uuid, self.format),
            None => format!("myevents {}", self.format),
        }
    }
}

/// `filter [delete] <header> <value>`, narrowing (or widening back) the
/// event stream by header match.
#[derive(Debug, Clone)]
pub struct Filter {
    pub delete: bool,
    pub header: String,
    pub value: String,
}

impl Command for Filter {
    fn build_message(&self) -> String {
        if self.delete {
            format!("filter delete {} {}", self.header, self.value)
        } else {
            format!("filter {} {}", self.header, self.value)
        }
    }
}

/// `linger [<seconds>]` / `nolinger`, keeping the outbound socket open after
/// the call ends so remaining events can be drained.
///
/// Also a state mutator: the connection picks the directive up while
/// serializing the command and adjusts when it closes the socket after a
/// disconnect notice.
#[derive(Debug, Clone, Copy)]
pub struct Linger {
    pub enabled: bool,
    /// `None` (or zero) with `enabled` means linger without a bound, which
    /// also disables the library's auto-close.
    pub seconds: Option<Duration>,
}

impl Command for Linger {
    fn build_message(&self) -> String {
        if !self.enabled {
            return "nolinger".to_string();
        }
        match self.seconds {
            Some(seconds) if !seconds.is_zero() => format!("linger {}", seconds.as_secs()),
            _ => "linger".to_string(),
        }
    }

    fn linger_directive(&self) -> Option<LingerDirective> {
        Some(if !self.enabled {
            LingerDirective::Disable
        } else {
            match self.seconds {
                Some(seconds) if !seconds.is_zero() => LingerDirective::Delay(seconds),
                _ => LingerDirective::Forever,
            }
        })
    }
}

/// `sendmsg [<uuid>]` with a header block and optional body, the carrier
/// for dialplan application execution and channel messages.
#[derive(Debug, Clone, Default)]
pub struct SendMsg {
    pub uuid: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl Command for SendMsg {
    fn build_message(&self) -> String {
        let mut message = match &self.uuid {
            Some(uuid) => format!("sendmsg {}", uuid),
            None => "sendmsg".to_string(),
        };
        for (name, value) in &self.headers {
            let _ = write!(message, "\n{}: {}", name, value);
        }
        if let Some(body) = &self.body {
            let _ = write!(message, "\nContent-Length: {}\n\n{}", body.len(), body);
        }
        message
    }
}

/// `sendmsg` carrying `call-command: execute`, running a dialplan
/// application on a channel.
#[derive(Debug, Clone, Default)]
pub struct Execute {
    /// Channel UUID; `None` on outbound sockets where the session is attached.
    pub uuid: Option<String>,
    pub app: String,
    pub args: Option<String>,
    /// Repeat count; emitted only when greater than one.
    pub loops: u32,
    /// Serialize with other executes on the channel.
    pub event_lock: bool,
}

impl Execute {
    /// `answer` the attached channel.
    pub fn answer() -> Self {
        Self {
            app: "answer".to_string(),
            ..Self::default()
        }
    }

    /// `hangup`, optionally with a cause like `NORMAL_CLEARING`.
    pub fn hangup(cause: Option<&str>) -> Self {
        Self {
            app: "hangup".to_string(),
            args: cause.map(str::to_string),
            ..Self::default()
        }
    }

    /// `playback` an audio file on the channel.
    pub fn playback(file: &str) -> Self {
        Self {
            app: "playback".to_string(),
            args: Some(file.to_string()),
            ..Self::default()
        }
    }

    /// `send_dtmf` digits (with optional `@duration`).
    pub fn send_dtmf(digits: &str) -> Self {
        Self {
            app: "send_dtmf".to_string(),
            args: Some(digits.to_string()),
            ..Self::default()
        }
    }

    /// Target a specific channel UUID (inbound mode).
    pub fn on_channel(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }
}

impl Command for Execute {
    fn build_message(&self) -> String {
        let mut headers = vec![
            ("call-command".to_string(), "execute".to_string()),
            ("execute-app-name".to_string(), self.app.clone()),
        ];
        if let Some(args) = &self.args {
            headers.push(("execute-app-arg".to_string(), args.clone()));
        }
        if self.loops > 1 {
            headers.push(("loops".to_string(), self.loops.to_string()));
        }
        if self.event_lock {
            headers.push(("event-lock".to_string(), "true".to_string()));
        }
        SendMsg {
            uuid: self.uuid.clone(),
            headers,
            body: None,
        }
        .build_message()
    }
}

/// `sendevent <name>` with a header block and optional body, firing an
/// event into the softswitch's event bus.
#[derive(Debug, Clone, Default)]
pub struct SendEvent {
    pub name: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl Command for SendEvent {
    fn build_message(&self) -> String {
        let mut message = format!("sendevent {}", self.name);
        for (name, value) in &self.headers {
            let _ = write!(message, "\n{}: {}", name, value);
        }
        if let Some(body) = &self.body {
            let _ = write!(message, "\nContent-Length: {}\n\n{}", body.len(), body);
        }
        message
    }
}

/// `originate <aleg> <bleg>` via api or bgapi.
#[derive(Debug, Clone)]
pub struct Originate {
    /// Origination endpoint, e.g. `sofia/gateway/provider/18005551234`,
    /// with any `{var=value}` prefix already applied.
    pub aleg: String,
    /// Destination: an extension or an `&app(args)` target like `&park()`.
    pub bleg: String,
    pub background: bool,
}

impl Command for Originate {
    fn build_message(&self) -> String {
        Api {
            command: "originate".to_string(),
            arguments: format!("{} {}", self.aleg, self.bleg),
            background: self.background,
        }
        .build_message()
    }
}
