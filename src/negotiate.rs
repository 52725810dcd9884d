//! Selection of the best content coding among client preferences and
//! registered providers.

use crate::accept::EncodingPreference;

const IDENTITY: &str = "identity";
const WILDCARD: &str = "*";

/// Outcome of content-coding negotiation for one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationResult {
    /// The coding to apply, or `None` to send the body uncompressed.
    pub chosen: Option<String>,
}

impl NegotiationResult {
    fn uncompressed() -> Self {
        Self { chosen: None }
    }
}

/// The effective weight of one candidate coding.
///
/// `explicit` records whether the quality came from an exact token match
/// rather than from `*` or from identity's implicit default; ties between a
/// provider and identity are resolved on it.
#[derive(Debug, Clone, Copy)]
struct Weight {
    quality: f32,
    explicit: bool,
}

fn weigh(preferences: &[EncodingPreference], token: &str, implicit: f32) -> Weight {
    if let Some(preference) = preferences.iter().find(|p| p.token == token) {
        return Weight {
            quality: preference.quality,
            explicit: true,
        };
    }
    if let Some(wildcard) = preferences.iter().find(|p| p.token == WILDCARD) {
        return Weight {
            quality: wildcard.quality,
            explicit: false,
        };
    }
    Weight {
        quality: implicit,
        explicit: false,
    }
}

/// Picks the best coding for the given preferences among the supported
/// provider tokens, in provider preference order.
///
/// An empty preference list means the client did not ask for compression, so
/// no coding is chosen. Identity is implicitly acceptable at quality 1.0
/// unless the header says otherwise; a provider is only chosen when its
/// effective quality beats identity's, or matches it without both sides
/// having been explicitly listed. Equal-quality providers resolve to the
/// first one in provider order.
pub(crate) fn negotiate<'a, I>(
    preferences: &[EncodingPreference],
    supported: I,
) -> NegotiationResult
where
    I: IntoIterator<Item = &'a str>,
{
    if preferences.is_empty() {
        return NegotiationResult::uncompressed();
    }

    let identity = weigh(preferences, IDENTITY, 1.0);

    let mut best: Option<(&str, Weight)> = None;
    for token in supported {
        let weight = weigh(preferences, token, 0.0);
        if weight.quality <= 0.0 {
            continue;
        }
        // Strict improvement only, so earlier providers win ties.
        if best.is_none_or(|(_, current)| weight.quality > current.quality) {
            best = Some((token, weight));
        }
    }

    let Some((token, weight)) = best else {
        return NegotiationResult::uncompressed();
    };

    if weight.quality < identity.quality {
        return NegotiationResult::uncompressed();
    }
    if weight.quality == identity.quality && identity.explicit && weight.explicit {
        // Exact tie between two explicitly listed candidates: the null
        // transformation wins.
        return NegotiationResult::uncompressed();
    }

    NegotiationResult {
        chosen: Some(token.to_owned()),
    }
}
