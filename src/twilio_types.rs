pub fn wrap_twiml(twiml: String) -> String {
    format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>{twiml}")
}

mod twiml {
    use xmlserde::xml_serde_enum;
    use xmlserde_derives::XmlSerialize;

    #[derive(PartialEq, Eq, XmlSerialize)]
    #[xmlserde(root = b"Response")]
    pub struct Response {
        #[xmlserde(ty = "untag")]
        pub actions: Vec<ResponseAction>,
    }

    #[derive(PartialEq, Eq, XmlSerialize)]
    pub enum ResponseAction {
        #[xmlserde(name = b"Say")]
        Say(SayAction),
        #[xmlserde(name = b"Gather")]
        Gather(GatherAction),
        #[xmlserde(name = b"Dial")]
        Dial(DialAction),
        #[xmlserde(name = b"Hangup")]
        Hangup(HangupAction),
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct SayAction {
        #[xmlserde(ty = "text")]
        pub text: String,
        #[xmlserde(name = b"voice", ty = "attr")]
        pub voice: Option<String>,
        #[xmlserde(name = b"loop", ty = "attr")]
        pub lp: Option<u16>,
        #[xmlserde(name = b"language", ty = "attr")]
        pub language: Option<String>,
    }

    /// Speech capture; Twilio posts the recognised text to `action`.
    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct GatherAction {
        #[xmlserde(name = b"input", ty = "attr")]
        pub input: Option<GatherInput>,
        #[xmlserde(name = b"timeout", ty = "attr")]
        pub timeout: Option<u16>,
        #[xmlserde(name = b"speechTimeout", ty = "attr")]
        pub speech_timeout: Option<String>,
        #[xmlserde(name = b"language", ty = "attr")]
        pub language: Option<String>,
        #[xmlserde(name = b"action", ty = "attr")]
        pub action: Option<String>,
        #[xmlserde(name = b"method", ty = "attr")]
        pub method: Option<String>,
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct DialAction {
        #[xmlserde(ty = "text")]
        pub number: String,
        #[xmlserde(name = b"timeout", ty = "attr")]
        pub timeout: Option<u16>,
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct HangupAction {}

    xml_serde_enum! {
        #[derive(PartialEq, Eq, Debug)]
        GatherInput {
            Speech => "speech",
            Dtmf => "dtmf",
            SpeechDtmf => "dtmf speech",
        }
    }
}
pub use twiml::*;

mod webhook {
    use serde::Deserialize;

    /// Twilio `CallStatus` values, as posted to voice and status-callback webhooks.
    #[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
    #[serde(rename_all = "kebab-case")]
    pub enum CallStatus {
        Queued,
        Initiated,
        Ringing,
        InProgress,
        Completed,
        Busy,
        Failed,
        NoAnswer,
        Canceled,
    }

    #[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
    #[serde(rename_all = "kebab-case")]
    pub enum CallDirection {
        Inbound,
        OutboundApi,
        OutboundDial,
    }

    /// Form body of the initial voice webhook (incoming call or answered outbound call).
    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "PascalCase")]
    pub struct VoiceWebhookPayload {
        pub call_sid: String,
        pub from: String,
        pub to: Option<String>,
        pub call_status: CallStatus,
        pub direction: Option<CallDirection>,
    }

    /// Form body posted by `<Gather input="speech">`.
    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "PascalCase")]
    pub struct GatherPayload {
        pub call_sid: String,
        pub speech_result: Option<String>,
        pub confidence: Option<f32>,
    }

    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "PascalCase")]
    pub struct StatusCallbackPayload {
        pub call_sid: String,
        pub call_status: CallStatus,
        pub call_duration: Option<String>,
    }
}
pub use webhook::*;

mod rest {
    use serde::Deserialize;

    /// The parts of Twilio's Call resource we keep.
    #[derive(Deserialize, Debug)]
    pub struct TwilioCallResource {
        pub sid: String,
        pub status: Option<String>,
    }

    #[derive(Deserialize, Debug)]
    pub struct TwilioMessageResource {
        pub sid: String,
        pub status: Option<String>,
    }
}
pub use rest::*;

use crate::db_types::CallSessionStatus;

impl CallStatus {
    /// Session lifecycle status for a Twilio call status.
    pub fn session_status(&self) -> CallSessionStatus {
        match self {
            CallStatus::Queued | CallStatus::Initiated | CallStatus::Ringing => {
                CallSessionStatus::Initiated
            }
            CallStatus::InProgress => CallSessionStatus::InProgress,
            CallStatus::Completed => CallSessionStatus::Completed,
            CallStatus::Busy | CallStatus::Failed | CallStatus::Canceled => {
                CallSessionStatus::Failed
            }
            CallStatus::NoAnswer => CallSessionStatus::NoAnswer,
        }
    }
}

/// Builder for the handful of TwiML shapes the call flow produces.
#[derive(Default)]
pub struct TwimlBuilder {
    actions: Vec<ResponseAction>,
}

impl TwimlBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn say(mut self, text: impl Into<String>, voice: &str, language: &str) -> Self {
        self.actions.push(ResponseAction::Say(SayAction {
            text: text.into(),
            voice: Some(voice.to_string()),
            language: Some(language.to_string()),
            ..Default::default()
        }));
        self
    }

    pub fn gather_speech(mut self, action: String, timeout: u16, language: &str) -> Self {
        self.actions.push(ResponseAction::Gather(GatherAction {
            input: Some(GatherInput::Speech),
            timeout: Some(timeout),
            speech_timeout: Some("auto".to_string()),
            language: Some(language.to_string()),
            action: Some(action),
            method: Some("POST".to_string()),
        }));
        self
    }

    pub fn dial(mut self, number: &str) -> Self {
        self.actions.push(ResponseAction::Dial(DialAction {
            number: number.to_string(),
            ..Default::default()
        }));
        self
    }

    pub fn hangup(mut self) -> Self {
        self.actions.push(ResponseAction::Hangup(HangupAction {}));
        self
    }

    pub fn build(self) -> String {
        let response = Response {
            actions: self.actions,
        };
        wrap_twiml(xmlserde::xml_serialize(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn twiml_has_declaration_and_verbs_in_order() {
        let twiml = TwimlBuilder::new()
            .say("Hello there", "alice", "en-IN")
            .gather_speech(
                "https://bot.example.com/voice/continue?session_id=1".to_string(),
                5,
                "en-IN",
            )
            .say("Goodbye", "alice", "en-IN")
            .hangup()
            .build();
        assert!(twiml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response"));
        let say = twiml.find("Hello there").unwrap();
        let gather = twiml.find("<Gather").unwrap();
        let hangup = twiml.find("<Hangup").unwrap();
        assert!(say < gather && gather < hangup);
        assert!(twiml.contains("input=\"speech\""));
        assert!(twiml.contains("speechTimeout=\"auto\""));
        assert!(twiml.contains("language=\"en-IN\""));
        assert!(twiml.contains("voice=\"alice\""));
    }

    #[test]
    fn dial_carries_the_number() {
        let twiml = TwimlBuilder::new().dial("+911234567890").build();
        assert!(twiml.contains("<Dial"));
        assert!(twiml.contains("+911234567890"));
    }

    #[test]
    fn twilio_statuses_map_onto_session_lifecycle() {
        assert_eq!(CallStatus::Ringing.session_status(), CallSessionStatus::Initiated);
        assert_eq!(
            CallStatus::InProgress.session_status(),
            CallSessionStatus::InProgress
        );
        assert_eq!(CallStatus::Busy.session_status(), CallSessionStatus::Failed);
        assert_eq!(CallStatus::Canceled.session_status(), CallSessionStatus::Failed);
        assert_eq!(CallStatus::NoAnswer.session_status(), CallSessionStatus::NoAnswer);
        assert_eq!(
            CallStatus::Completed.session_status(),
            CallSessionStatus::Completed
        );
    }

    #[test]
    fn voice_webhook_form_parses() {
        let body = "AccountSid=AC1&CallSid=CA123&From=%2B919876543210&To=%2B15550001111\
                    &CallStatus=ringing&Direction=inbound&ApiVersion=2010-04-01";
        let payload: VoiceWebhookPayload = serde_urlencoded::from_str(body).unwrap();
        assert_eq!(payload.call_sid, "CA123");
        assert_eq!(payload.from, "+919876543210");
        assert_eq!(payload.call_status, CallStatus::Ringing);
        assert_eq!(payload.direction, Some(CallDirection::Inbound));
    }

    #[test]
    fn gather_form_parses_speech_and_confidence() {
        let body = "CallSid=CA123&SpeechResult=I+will+pay+on+Friday.&Confidence=0.92";
        let payload: GatherPayload = serde_urlencoded::from_str(body).unwrap();
        assert_eq!(payload.speech_result.as_deref(), Some("I will pay on Friday."));
        assert_eq!(payload.confidence, Some(0.92));

        let payload: GatherPayload = serde_urlencoded::from_str("CallSid=CA9").unwrap();
        assert!(payload.speech_result.is_none());
        assert!(payload.confidence.is_none());
    }

    #[test]
    fn status_callback_form_parses() {
        let body = "CallSid=CA123&CallStatus=no-answer&CallDuration=0";
        let payload: StatusCallbackPayload = serde_urlencoded::from_str(body).unwrap();
        assert_eq!(payload.call_status, CallStatus::NoAnswer);
        assert_eq!(payload.call_duration.as_deref(), Some("0"));
    }
}
