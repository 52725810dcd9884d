//! Parsing of the `Accept-Encoding` request header into weighted preferences.

/// A single content-coding preference advertised by the client.
///
/// Tokens are normalized to lowercase. `identity` and `*` are carried through
/// like any other token and interpreted by the negotiator.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodingPreference {
    /// Lowercased content-coding token (e.g. `gzip`, `identity`, `*`).
    pub token: String,
    /// Quality weight in `[0.0, 1.0]`. `0.0` means explicitly rejected.
    pub quality: f32,
}

/// Parses every `Accept-Encoding` field value on a request into an ordered
/// preference list.
///
/// Each field value is a comma-separated list of elements like `gzip` or
/// `br;q=0.8`. Empty list slots are skipped per the HTTP `#rule` grammar.
/// A malformed or missing `q` parameter defaults to 1.0; out-of-range values
/// are clamped. An absent header yields an empty list, which the negotiator
/// treats as "no compression requested".
pub(crate) fn parse_accept_encoding<'a, I>(values: I) -> Vec<EncodingPreference>
where
    I: IntoIterator<Item = &'a str>,
{
    values
        .into_iter()
        .flat_map(|value| value.split(','))
        .filter_map(parse_element)
        .collect()
}

/// Parses one list element like `gzip`, `br;q=0.8`, or `*;q=0`.
fn parse_element(element: &str) -> Option<EncodingPreference> {
    let mut segments = element.split(';');
    let token = segments.next()?.trim();
    if token.is_empty() {
        return None;
    }

    let quality = segments
        .find_map(|param| {
            let param = param.trim();
            param
                .strip_prefix("q=")
                .or_else(|| param.strip_prefix("Q="))
                .map(parse_quality)
        })
        .unwrap_or(1.0);

    Some(EncodingPreference {
        token: token.to_ascii_lowercase(),
        quality,
    })
}

/// Parses a quality value, recovering from malformed input by treating it as
/// fully acceptable.
fn parse_quality(raw: &str) -> f32 {
    raw.trim()
        .parse::<f32>()
        .map_or(1.0, |q| q.clamp(0.0, 1.0))
}
