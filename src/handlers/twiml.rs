//! # Call-Control (TwiML) Endpoints
//!
//! The two HTTP endpoints the telephony provider hits before any audio flows:
//!
//! 1. `/incoming-call` answers the call with a bilingual DTMF language menu.
//! 2. `/language-selection` reads the chosen digit and returns markup that
//!    connects the call's media stream to this service's `/media-stream`
//!    WebSocket, carrying the language as a query parameter.
//!
//! The markup is small and fixed-shape, so it is built with `format!` rather
//! than an XML library.

use crate::session::Language;
use crate::state::AppState;
use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use tracing::info;

/// Form fields the telephony provider posts to `/language-selection`.
/// It sends many more fields than this; serde ignores the rest.
#[derive(Debug, Deserialize)]
pub struct LanguageSelectionForm {
    #[serde(rename = "Digits", default)]
    pub digits: String,
}

/// Build the DTMF language menu.
///
/// English callers just stay on the line: the `<Gather>` times out after five
/// seconds with no digits and the `<Redirect>` re-enters `/language-selection`
/// with an empty `Digits` field, which maps to English.
pub fn language_menu_twiml() -> String {
    concat!(
        r#"<?xml version="1.0" encoding="UTF-8"?>"#,
        "<Response>",
        r#"<Gather action="/language-selection" method="POST" numDigits="1" timeout="5">"#,
        r#"<Say voice="Polly.Matthew-Neural">You have reached the employee tip line. For English, please stay on the line.</Say>"#,
        r#"<Pause length="1"/>"#,
        r#"<Say voice="Polly.Lupe-Neural">Para español, presione uno.</Say>"#,
        "</Gather>",
        "<Redirect>/language-selection</Redirect>",
        "</Response>"
    )
    .to_string()
}

/// Build the markup that hands the call's audio over to the media-stream
/// WebSocket. The trailing `<Pause>` + `<Say>` only play if the stream never
/// connects; on a healthy bridge the `<Connect>` holds the call open.
pub fn stream_connect_twiml(domain: &str, language: Language) -> String {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            "<Response>",
            r#"<Connect><Stream url="wss://{domain}/media-stream?lang={lang}"/></Connect>"#,
            r#"<Pause length="15"/>"#,
            "<Say>We're sorry, but there was an issue connecting. Please call back later.</Say>",
            "</Response>"
        ),
        domain = domain,
        lang = language.as_str()
    )
}

/// GET/POST `/incoming-call`
pub async fn incoming_call() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("application/xml")
        .body(language_menu_twiml())
}

/// POST `/language-selection`
pub async fn language_selection(
    req: HttpRequest,
    state: web::Data<AppState>,
    form: web::Form<LanguageSelectionForm>,
) -> HttpResponse {
    let language = Language::from_digits(&form.digits);
    info!(
        language = language.as_str(),
        digits = %form.digits,
        "Language selected"
    );

    let config = state.get_config();
    let domain = if config.telephony.public_url.is_empty() {
        req.connection_info().host().to_string()
    } else {
        config.telephony.public_url.clone()
    };

    HttpResponse::Ok()
        .content_type("application/xml")
        .body(stream_connect_twiml(&domain, language))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_menu_shape() {
        let twiml = language_menu_twiml();
        assert!(twiml.contains(r#"<Gather action="/language-selection" method="POST" numDigits="1" timeout="5">"#));
        assert!(twiml.contains("Para español, presione uno."));
        assert!(twiml.contains("<Redirect>/language-selection</Redirect>"));
    }

    #[test]
    fn test_stream_connect_carries_language() {
        let twiml = stream_connect_twiml("tips.example.com", Language::Spanish);
        assert!(twiml.contains(r#"<Stream url="wss://tips.example.com/media-stream?lang=es"/>"#));
        // fallback branch for a stream that never connects
        assert!(twiml.contains(r#"<Pause length="15"/>"#));

        let twiml = stream_connect_twiml("tips.example.com", Language::English);
        assert!(twiml.contains("lang=en"));
    }
}
