//! ESL events: inner headers and payload parsed out of a raw envelope

use std::fmt;
use std::str::FromStr;

use crate::constants::{
    CONTENT_TYPE_EVENT_JSON, CONTENT_TYPE_EVENT_PLAIN, CONTENT_TYPE_EVENT_XML,
    HEADER_APPLICATION_UUID, HEADER_CONTENT_LENGTH, HEADER_JOB_UUID, HEADER_UNIQUE_ID,
};
use crate::error::{EslError, EslResult};
use crate::response::{parse_header_line, Headers, RawResponse};

/// Event serialization formats supported by FreeSWITCH ESL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum EventFormat {
    /// Plain text format (default)
    Plain,
    /// JSON format
    Json,
    /// XML format
    Xml,
}

impl EventFormat {
    /// Map an event Content-Type onto its format, `None` for non-event types.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        match content_type {
            CONTENT_TYPE_EVENT_PLAIN => Some(Self::Plain),
            CONTENT_TYPE_EVENT_JSON => Some(Self::Json),
            CONTENT_TYPE_EVENT_XML => Some(Self::Xml),
            _ => None,
        }
    }
}

impl fmt::Display for EventFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventFormat::Plain => write!(f, "plain"),
            EventFormat::Json => write!(f, "json"),
            EventFormat::Xml => write!(f, "xml"),
        }
    }
}

/// Error returned when parsing an invalid event format string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEventFormatError(pub String);

impl fmt::Display for ParseEventFormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown event format: {}", self.0)
    }
}

impl std::error::Error for ParseEventFormatError {}

impl FromStr for EventFormat {
    type Err = ParseEventFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(Self::Plain),
            "json" => Ok(Self::Json),
            "xml" => Ok(Self::Xml),
            _ => Err(ParseEventFormatError(s.to_string())),
        }
    }
}

/// Error returned when parsing an unknown event name string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEventNameError(pub String);

impl fmt::Display for ParseEventNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown event name: {}", self.0)
    }
}

impl std::error::Error for ParseEventNameError {}

/// Generates `EventName` with `as_str()`, `Display`, and `FromStr`.
macro_rules! event_names {
    ( $( $(#[$meta:meta])* $variant:ident => $wire:literal ),+ $(,)? ) => {
        /// FreeSWITCH event names in the canonical `switch_event.c` order.
        ///
        /// Variants mirror the wire names (`ChannelAnswer` = `CHANNEL_ANSWER`).
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[non_exhaustive]
        #[allow(missing_docs)]
        pub enum EventName {
            $( $(#[$meta])* $variant, )+
        }

        impl EventName {
            /// Wire-format name string.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( EventName::$variant => $wire, )+
                }
            }
        }

        impl fmt::Display for EventName {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for EventName {
            type Err = ParseEventNameError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $(
                    if s.eq_ignore_ascii_case($wire) {
                        return Ok(EventName::$variant);
                    }
                )+
                Err(ParseEventNameError(s.to_string()))
            }
        }
    };
}

event_names! {
    Custom => "CUSTOM",
    Clone => "CLONE",
    ChannelCreate => "CHANNEL_CREATE",
    ChannelDestroy => "CHANNEL_DESTROY",
    ChannelState => "CHANNEL_STATE",
    ChannelCallstate => "CHANNEL_CALLSTATE",
    ChannelAnswer => "CHANNEL_ANSWER",
    ChannelHangup => "CHANNEL_HANGUP",
    ChannelHangupComplete => "CHANNEL_HANGUP_COMPLETE",
    ChannelExecute => "CHANNEL_EXECUTE",
    ChannelExecuteComplete => "CHANNEL_EXECUTE_COMPLETE",
    ChannelHold => "CHANNEL_HOLD",
    ChannelUnhold => "CHANNEL_UNHOLD",
    ChannelBridge => "CHANNEL_BRIDGE",
    ChannelUnbridge => "CHANNEL_UNBRIDGE",
    ChannelProgress => "CHANNEL_PROGRESS",
    ChannelProgressMedia => "CHANNEL_PROGRESS_MEDIA",
    ChannelOutgoing => "CHANNEL_OUTGOING",
    ChannelPark => "CHANNEL_PARK",
    ChannelUnpark => "CHANNEL_UNPARK",
    ChannelApplication => "CHANNEL_APPLICATION",
    ChannelOriginate => "CHANNEL_ORIGINATE",
    ChannelUuid => "CHANNEL_UUID",
    Api => "API",
    Log => "LOG",
    InboundChan => "INBOUND_CHAN",
    OutboundChan => "OUTBOUND_CHAN",
    Startup => "STARTUP",
    Shutdown => "SHUTDOWN",
    Publish => "PUBLISH",
    Unpublish => "UNPUBLISH",
    Talk => "TALK",
    Notalk => "NOTALK",
    SessionCrash => "SESSION_CRASH",
    ModuleLoad => "MODULE_LOAD",
    ModuleUnload => "MODULE_UNLOAD",
    Dtmf => "DTMF",
    Message => "MESSAGE",
    PresenceIn => "PRESENCE_IN",
    NotifyIn => "NOTIFY_IN",
    PresenceOut => "PRESENCE_OUT",
    PresenceProbe => "PRESENCE_PROBE",
    MessageWaiting => "MESSAGE_WAITING",
    MessageQuery => "MESSAGE_QUERY",
    Roster => "ROSTER",
    Codec => "CODEC",
    BackgroundJob => "BACKGROUND_JOB",
    DetectedSpeech => "DETECTED_SPEECH",
    DetectedTone => "DETECTED_TONE",
    PrivateCommand => "PRIVATE_COMMAND",
    Heartbeat => "HEARTBEAT",
    Trap => "TRAP",
    AddSchedule => "ADD_SCHEDULE",
    DelSchedule => "DEL_SCHEDULE",
    ExeSchedule => "EXE_SCHEDULE",
    ReSchedule => "RE_SCHEDULE",
    ReloadXml => "RELOADXML",
    Notify => "NOTIFY",
    PhoneFeature => "PHONE_FEATURE",
    PhoneFeatureSubscribe => "PHONE_FEATURE_SUBSCRIBE",
    SendMessage => "SEND_MESSAGE",
    RecvMessage => "RECV_MESSAGE",
    RequestParams => "REQUEST_PARAMS",
    ChannelData => "CHANNEL_DATA",
    General => "GENERAL",
    Command => "COMMAND",
    SessionHeartbeat => "SESSION_HEARTBEAT",
    ClientDisconnected => "CLIENT_DISCONNECTED",
    ServerDisconnected => "SERVER_DISCONNECTED",
    SendInfo => "SEND_INFO",
    RecvInfo => "RECV_INFO",
    RecvRtcpMessage => "RECV_RTCP_MESSAGE",
    SendRtcpMessage => "SEND_RTCP_MESSAGE",
    CallSecure => "CALL_SECURE",
    Nat => "NAT",
    RecordStart => "RECORD_START",
    RecordStop => "RECORD_STOP",
    PlaybackStart => "PLAYBACK_START",
    PlaybackStop => "PLAYBACK_STOP",
    CallUpdate => "CALL_UPDATE",
    Failure => "FAILURE",
    SocketData => "SOCKET_DATA",
    MediaBugStart => "MEDIA_BUG_START",
    MediaBugStop => "MEDIA_BUG_STOP",
    ConferenceDataQuery => "CONFERENCE_DATA_QUERY",
    ConferenceData => "CONFERENCE_DATA",
    CallSetupReq => "CALL_SETUP_REQ",
    CallSetupResult => "CALL_SETUP_RESULT",
    CallDetail => "CALL_DETAIL",
    DeviceState => "DEVICE_STATE",
    Text => "TEXT",
    ShutdownRequested => "SHUTDOWN_REQUESTED",
    /// Subscribe to all events
    All => "ALL",
}

/// A parsed event: the raw envelope plus the inner header block and payload
/// decoded from the envelope body.
///
/// `text/event-plain`, `-json`, and `-xml` all wrap the real event headers
/// inside the envelope body; the envelope itself only carries framing
/// headers (and, on outbound sockets, sometimes the channel UUID).
#[derive(Debug, Clone)]
pub struct Event {
    envelope: RawResponse,
    headers: Headers,
    body: Vec<u8>,
}

impl Event {
    /// Decode the envelope body according to the sink format it arrived on.
    pub(crate) fn parse(envelope: RawResponse, format: EventFormat) -> EslResult<Self> {
        match format {
            EventFormat::Plain => Self::parse_plain(envelope),
            EventFormat::Json => Self::parse_json(envelope),
            EventFormat::Xml => Self::parse_xml(envelope),
        }
    }

    /// Plain events carry `Name: value` lines terminated by a blank line;
    /// if the lines include their own `Content-Length`, that many bytes of
    /// inner body follow.
    fn parse_plain(envelope: RawResponse) -> EslResult<Self> {
        let text = envelope
            .body_str()
            .ok_or_else(|| EslError::protocol("plain event body is not UTF-8"))?;

        let (header_section, remainder) = match text.find("\n\n") {
            Some(pos) => (&text[..pos], &text[pos + 2..]),
            None => (text, ""),
        };

        let mut headers = Headers::new();
        for line in header_section.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            if let Ok((name, value)) = parse_header_line(line) {
                headers.add(&name, value);
            }
        }

        let body = match headers
            .get(HEADER_CONTENT_LENGTH)
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            Some(length) => {
                let bytes = remainder.as_bytes();
                bytes[..length.min(bytes.len())].to_vec()
            }
            None => remainder
                .as_bytes()
                .to_vec(),
        };

        Ok(Self {
            envelope,
            headers,
            body,
        })
    }

    /// JSON events are one object: fields become headers, `_body` becomes
    /// the payload. Values are not percent-encoded in this format.
    fn parse_json(envelope: RawResponse) -> EslResult<Self> {
        let value: serde_json::Value = serde_json::from_slice(envelope.body())?;
        let object = value
            .as_object()
            .ok_or_else(|| EslError::protocol("JSON event body is not an object"))?;

        let mut headers = Headers::new();
        let mut body = Vec::new();
        for (key, field) in object {
            let text = match field {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if key == "_body" {
                body = text.into_bytes();
            } else {
                headers.add(key, text);
            }
        }

        Ok(Self {
            envelope,
            headers,
            body,
        })
    }

    /// XML events:
    /// ```xml
    /// <event>
    ///   <headers>
    ///     <Event-Name>HEARTBEAT</Event-Name>
    ///   </headers>
    ///   <body>...</body>
    /// </event>
    /// ```
    fn parse_xml(envelope: RawResponse) -> EslResult<Self> {
        use quick_xml::events::Event as XmlEvent;
        use quick_xml::Reader;

        let text = envelope
            .body_str()
            .ok_or_else(|| EslError::protocol("XML event body is not UTF-8"))?;

        let mut reader = Reader::from_str(text);
        let mut headers = Headers::new();
        let mut body = Vec::new();
        let mut in_headers = false;
        let mut in_body = false;
        let mut current_tag: Option<String> = None;

        loop {
            match reader.read_event()? {
                XmlEvent::Start(ref e) => {
                    let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                    match tag.as_str() {
                        "headers" => in_headers = true,
                        "body" => in_body = true,
                        _ if in_headers => current_tag = Some(tag),
                        _ => {}
                    }
                }
                XmlEvent::End(ref e) => {
                    let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                    match tag.as_str() {
                        "headers" => in_headers = false,
                        "body" => in_body = false,
                        _ if in_headers => current_tag = None,
                        _ => {}
                    }
                }
                XmlEvent::Text(ref e) => {
                    let text = e
                        .unescape()?
                        .to_string();
                    if in_body {
                        body = text.into_bytes();
                    } else if let Some(ref tag) = current_tag {
                        headers.add(tag, text);
                    }
                }
                XmlEvent::Eof => break,
                _ => {}
            }
        }

        Ok(Self {
            envelope,
            headers,
            body,
        })
    }

    /// `Event-Name`, from the inner headers or the envelope.
    pub fn name(&self) -> Option<&str> {
        self.header("Event-Name")
    }

    /// Typed event name, when `name()` is a recognized wire name.
    pub fn event_type(&self) -> Option<EventName> {
        self.name()?
            .parse()
            .ok()
    }

    /// Look up a header, inner block first, then the envelope.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .or_else(|| {
                self.envelope
                    .header(name)
            })
    }

    /// Whether the header exists in either the inner block or the envelope.
    pub fn has_header(&self, name: &str) -> bool {
        self.headers
            .contains(name)
            || self
                .envelope
                .has_header(name)
    }

    /// The inner event headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The raw envelope the event arrived in.
    pub fn envelope(&self) -> &RawResponse {
        &self.envelope
    }

    /// Innermost payload after inner-header parsing.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Payload as UTF-8, if valid.
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// `Unique-ID` of the channel the event belongs to.
    pub fn unique_id(&self) -> Option<&str> {
        self.header(HEADER_UNIQUE_ID)
    }

    /// `Application-UUID` for execute-complete style events.
    pub fn application_uuid(&self) -> Option<&str> {
        self.header(HEADER_APPLICATION_UUID)
    }

    /// `Job-UUID` from `bgapi` BACKGROUND_JOB events.
    pub fn job_uuid(&self) -> Option<&str> {
        self.header(HEADER_JOB_UUID)
    }

    /// `Event-Subclass` for CUSTOM events (e.g. `sofia::register`).
    pub fn subclass(&self) -> Option<&str> {
        self.header("Event-Subclass")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::parse_header_block;

    fn envelope(content_type: &str, body: &str) -> RawResponse {
        let headers = parse_header_block(&format!(
            "Content-Type: {}\nContent-Length: {}",
            content_type,
            body.len()
        ))
        .unwrap();
        RawResponse::new(headers, body.as_bytes().to_vec())
    }

    #[test]
    fn test_format_from_content_type() {
        assert_eq!(
            EventFormat::from_content_type("text/event-plain"),
            Some(EventFormat::Plain)
        );
        assert_eq!(
            EventFormat::from_content_type("text/event-json"),
            Some(EventFormat::Json)
        );
        assert_eq!(
            EventFormat::from_content_type("text/event-xml"),
            Some(EventFormat::Xml)
        );
        assert_eq!(EventFormat::from_content_type("command/reply"), None);
    }

    #[test]
    fn test_format_round_trip() {
        assert_eq!("plain".parse::<EventFormat>(), Ok(EventFormat::Plain));
        assert_eq!(EventFormat::Json.to_string(), "json");
        assert!("yaml"
            .parse::<EventFormat>()
            .is_err());
    }

    #[test]
    fn test_event_name_parse() {
        assert_eq!(
            "CHANNEL_ANSWER".parse::<EventName>(),
            Ok(EventName::ChannelAnswer)
        );
        assert_eq!(
            "channel_answer".parse::<EventName>(),
            Ok(EventName::ChannelAnswer)
        );
        assert_eq!(EventName::BackgroundJob.to_string(), "BACKGROUND_JOB");
        assert!("NOT_AN_EVENT"
            .parse::<EventName>()
            .is_err());
    }

    #[test]
    fn test_parse_plain_event() {
        let body = "Event-Name: CHANNEL_ANSWER\nUnique-ID: test-uuid\n\n";
        let event = Event::parse(envelope("text/event-plain", body), EventFormat::Plain).unwrap();

        assert_eq!(event.name(), Some("CHANNEL_ANSWER"));
        assert_eq!(event.event_type(), Some(EventName::ChannelAnswer));
        assert_eq!(event.unique_id(), Some("test-uuid"));
        assert!(event
            .body()
            .is_empty());
    }

    #[test]
    fn test_parse_plain_event_percent_decoding() {
        let body = "Event-Name: HEARTBEAT\nUp-Time: 0%20years%2C%200%20days\n\n";
        let event = Event::parse(envelope("text/event-plain", body), EventFormat::Plain).unwrap();

        assert_eq!(event.event_type(), Some(EventName::Heartbeat));
        assert_eq!(event.header("Up-Time"), Some("0 years, 0 days"));
    }

    #[test]
    fn test_parse_plain_event_with_inner_body() {
        let body = "Content-Length: 8\nContent-Type: string\nUnique-Id: call-1\nTest-Header: test-header1\nEvent-Name: CHANNEL_ANSWER\n\nanswered";
        let event = Event::parse(envelope("text/event-plain", body), EventFormat::Plain).unwrap();

        assert_eq!(event.name(), Some("CHANNEL_ANSWER"));
        assert_eq!(event.header("Unique-Id"), Some("call-1"));
        assert_eq!(event.header("Test-Header"), Some("test-header1"));
        assert_eq!(event.body_str(), Some("answered"));
    }

    #[test]
    fn test_parse_plain_event_name_from_envelope() {
        // Some notices only tag the envelope; header lookup falls through.
        let headers = parse_header_block(
            "Content-Type: text/event-plain\nEvent-Name: CHANNEL_ANSWER\nContent-Length: 14",
        )
        .unwrap();
        let raw = RawResponse::new(headers, b"Other-Key: v\n\n".to_vec());
        let event = Event::parse(raw, EventFormat::Plain).unwrap();
        assert_eq!(event.name(), Some("CHANNEL_ANSWER"));
    }

    #[test]
    fn test_parse_json_event() {
        let body = r#"{"Event-Name":"BACKGROUND_JOB","Job-UUID":"abc-123","_body":"+OK done\n"}"#;
        let event = Event::parse(envelope("text/event-json", body), EventFormat::Json).unwrap();

        assert_eq!(event.event_type(), Some(EventName::BackgroundJob));
        assert_eq!(event.job_uuid(), Some("abc-123"));
        assert_eq!(event.body_str(), Some("+OK done\n"));
    }

    #[test]
    fn test_parse_json_event_non_string_values() {
        let body = r#"{"Event-Name":"HEARTBEAT","Event-Sequence":4242}"#;
        let event = Event::parse(envelope("text/event-json", body), EventFormat::Json).unwrap();
        assert_eq!(event.header("Event-Sequence"), Some("4242"));
    }

    #[test]
    fn test_parse_json_event_rejects_non_object() {
        let raw = envelope("text/event-json", "[1,2,3]");
        assert!(Event::parse(raw, EventFormat::Json).is_err());
    }

    #[test]
    fn test_parse_xml_event() {
        let body = "<event>\n  <headers>\n    <Event-Name>HEARTBEAT</Event-Name>\n    <Core-UUID>abc-123</Core-UUID>\n  </headers>\n</event>";
        let event = Event::parse(envelope("text/event-xml", body), EventFormat::Xml).unwrap();

        assert_eq!(event.event_type(), Some(EventName::Heartbeat));
        assert_eq!(event.header("Core-UUID"), Some("abc-123"));
    }

    #[test]
    fn test_parse_xml_event_with_body() {
        let body = "<event>\n  <headers>\n    <Event-Name>BACKGROUND_JOB</Event-Name>\n    <Job-UUID>def-456</Job-UUID>\n  </headers>\n  <body>+OK result data</body>\n</event>";
        let event = Event::parse(envelope("text/event-xml", body), EventFormat::Xml).unwrap();

        assert_eq!(event.event_type(), Some(EventName::BackgroundJob));
        assert_eq!(event.job_uuid(), Some("def-456"));
        assert_eq!(event.body_str(), Some("+OK result data"));
    }
}
