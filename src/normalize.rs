//! Text normalization for scraped titles and artist names.
//!
//! Every function here is pure. Each normalization produces two forms:
//! a `display` string (original casing and apostrophe style, cleaned up)
//! and a `comparison_key` used for every equality check and lookup.
//!
//! CRITICAL: catalog uniqueness is enforced on comparison keys. Changing the
//! key rules changes which scraped variants collapse onto one song.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use rustc_hash::FxHashSet;
use serde::Serialize;
use unicode_normalization::UnicodeNormalization;

// ============================================================================
// REGEX PATTERNS
// ============================================================================

/// A single, non-nested bracketed group plus the whitespace before it.
pub static BRACKET_GROUP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*[\(\[]([^\(\)\[\]]*)[\)\]]").unwrap());

/// Bracket contents that mark a release variant rather than part of the title.
/// Matched anywhere inside the bracket, on word boundaries.
pub static NOISE_VOCABULARY: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        // Featured artists: "(feat. SZA)", "[ft. Someone]", "(featuring X)"
        Regex::new(r"(?i)\b(?:feat\.?|ft\.|featuring)(?:\s|$)").unwrap(),
        // Edits: "(Radio Edit)", "(Clean Edit)", "[Edit]"
        Regex::new(r"(?i)\b(?:radio\s+edit|radio\s+version|radio\s+mix|edit)\b").unwrap(),
        // Content variants: "(Clean)", "[Explicit]", "(Dirty)"
        Regex::new(r"(?i)\b(?:clean|explicit|censored|dirty)\b").unwrap(),
        // Mixes: "(Remix)", "(Extended Mix)", "(Club Mix)"
        Regex::new(r"(?i)\b(?:remix(?:ed)?|extended(?:\s+(?:mix|version))?|original\s+mix|club\s+mix)\b").unwrap(),
        // Releases: "(2011 Remaster)", "[Single Version]", "(Mono)"
        Regex::new(r"(?i)\b(?:remaster(?:ed)?|single\s+version|album\s+version|mono|stereo|bonus\s+track)\b").unwrap(),
        // Performances: "(Live at Wembley)", "(Live)", "(Acoustic Version)"
        Regex::new(r"(?i)^\s*live\s*$|\blive\s+(?:at|from|in|on)\b|\bacoustic\s+version\b").unwrap(),
    ]
});

/// Runs of any Unicode whitespace.
pub static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Roman numerals kept upper-case when title-casing an all-caps source.
pub static ROMAN_NUMERAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[IVX]{2,}$").unwrap());

// ============================================================================
// WORD LISTS
// ============================================================================

/// Words kept lower-case by title casing unless they open the string.
pub static LOWERCASE_WORDS: Lazy<FxHashSet<&'static str>> = Lazy::new(|| {
    [
        "a", "an", "and", "as", "at", "but", "by", "feat.", "ft.", "for", "from", "in", "nor",
        "of", "on", "or", "the", "to", "vs", "vs.", "with",
    ]
    .into_iter()
    .collect()
});

/// Names and acronyms that are always fully upper-case.
pub static ACRONYMS: Lazy<FxHashSet<&'static str>> = Lazy::new(|| {
    [
        "ABBA", "AC/DC", "ACDC", "B2K", "BTS", "DJ", "DMX", "ELO", "EPMD", "INXS", "KISS", "LL",
        "MFSB", "MGMT", "NSYNC", "OK", "R.E.M.", "REM", "RUN-DMC", "SWV", "SZA", "TLC", "TV",
        "UB40", "UK", "USA", "XTC", "ZZ",
    ]
    .into_iter()
    .collect()
});

// ============================================================================
// OUTPUT TYPE
// ============================================================================

/// Result of normalizing a title or artist string.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub struct NormalizedText {
    pub display: String,
    pub comparison_key: String,
}

impl NormalizedText {
    pub fn is_empty(&self) -> bool {
        self.display.is_empty()
    }
}

// ============================================================================
// CHARACTER HELPERS
// ============================================================================

/// Check if a character is a Unicode combining mark (diacritical mark).
pub fn is_combining_mark(c: char) -> bool {
    matches!(c as u32, 0x0300..=0x036F | 0x1AB0..=0x1AFF | 0x1DC0..=0x1DFF | 0xFE20..=0xFE2F)
}

/// Remove diacritics via NFKD decomposition: "Beyoncé" → "Beyonce".
pub fn strip_diacritics(s: &str) -> String {
    s.nfkd().filter(|c| !is_combining_mark(*c)).collect()
}

/// Fold typographic apostrophes and accents used as apostrophes to U+0027.
pub fn fold_apostrophes(s: &str) -> String {
    s.replace(
        ['\u{2018}', '\u{2019}', '\u{201B}', '\u{02BC}', '\u{2032}', '\u{00B4}', '\u{0060}'],
        "'",
    )
    .replace("''", "'")
}

/// Fold the Unicode hyphen and dash block (U+2010..U+2015) to ASCII '-'.
pub fn unify_dashes(s: &str) -> String {
    s.chars()
        .map(|c| if ('\u{2010}'..='\u{2015}').contains(&c) { '-' } else { c })
        .collect()
}

fn collapse_whitespace(s: &str) -> String {
    WHITESPACE_RUN.replace_all(s.trim(), " ").into_owned()
}

// ============================================================================
// NOISE STRIPPING
// ============================================================================

/// True when bracket content names a release variant ("Clean", "feat. X", ...).
pub fn is_noise_content(content: &str) -> bool {
    NOISE_VOCABULARY.iter().any(|re| re.is_match(content))
}

/// Remove bracketed groups whose content is noise. Legitimate parentheticals
/// such as "(I Can't Get No) Satisfaction" are kept. A title made only of
/// noise is returned unchanged rather than emptied.
///
/// Only innermost groups match, so stripping repeats until nothing changes:
/// removing "(Remix)" from "(Live (Remix))" exposes "(Live)".
pub fn strip_noise_brackets(s: &str) -> String {
    let mut current = s.to_string();
    loop {
        let stripped = BRACKET_GROUP.replace_all(&current, |caps: &Captures| {
            if is_noise_content(&caps[1]) {
                String::new()
            } else {
                caps[0].to_string()
            }
        });
        if stripped == current {
            break;
        }
        current = stripped.into_owned();
    }
    if current.trim().is_empty() {
        s.to_string()
    } else {
        current
    }
}

// ============================================================================
// TITLE CASING
// ============================================================================

/// True when the string has cased letters and they are all upper or all lower.
pub fn is_single_case(s: &str) -> bool {
    let has_upper = s.chars().any(char::is_uppercase);
    let has_lower = s.chars().any(char::is_lowercase);
    has_upper != has_lower
}

fn acronym_key(word: &str) -> String {
    word.trim_matches(|c: char| matches!(c, '(' | ')' | '[' | ']' | '"' | ',' | ';' | ':'))
        .to_uppercase()
}

/// Capitalize the first letter of each hyphen/slash/bracket separated part.
/// Digits and apostrophes do not start a new part: SK8ER → Sk8er, AIN'T → Ain't.
fn capitalize_word(word: &str) -> String {
    let mut out = String::with_capacity(word.len());
    let mut at_start = true;
    for c in word.chars() {
        if c.is_alphabetic() {
            if at_start {
                out.extend(c.to_uppercase());
            } else {
                out.extend(c.to_lowercase());
            }
            at_start = false;
        } else {
            out.push(c);
            at_start = if c.is_numeric() || c == '\'' {
                false
            } else {
                matches!(c, '-' | '/' | '(' | '[' | '"')
            };
        }
    }
    out
}

/// Title-case a single-case string. Mixed-case input is returned unchanged.
pub fn title_case(s: &str) -> String {
    if !is_single_case(s) {
        return s.to_string();
    }
    let source_upper = s.chars().any(char::is_uppercase);

    s.split(' ')
        .enumerate()
        .map(|(i, word)| {
            let key = acronym_key(word);
            if ACRONYMS.contains(key.as_str()) {
                return word.to_uppercase();
            }
            if source_upper && ROMAN_NUMERAL.is_match(&key) {
                return word.to_string();
            }
            let lower = word.to_lowercase();
            if i > 0 && LOWERCASE_WORDS.contains(lower.as_str()) {
                return lower;
            }
            capitalize_word(word)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// NORMALIZATION FUNCTIONS
// ============================================================================

/// Build the comparison key from a display string.
/// Apostrophes folded, diacritics stripped, " & " read as " and ", lower-cased.
pub fn comparison_key(display: &str) -> String {
    let folded = strip_diacritics(&fold_apostrophes(display));
    let spaced = collapse_whitespace(&folded).replace(" & ", " and ");
    spaced.to_lowercase()
}

/// Cheap key for exact comparison: whitespace collapsed and lower-cased only.
pub fn simple_key(s: &str) -> String {
    collapse_whitespace(s).to_lowercase()
}

fn finish(display: String) -> NormalizedText {
    if display.is_empty() {
        return NormalizedText::default();
    }
    let comparison_key = comparison_key(&display);
    NormalizedText {
        display,
        comparison_key,
    }
}

/// Normalize a song title: NFKC, dash folding, noise bracket stripping,
/// whitespace collapse and title casing for single-case input.
pub fn normalize_title(title: &str) -> NormalizedText {
    let nfkc: String = title.nfkc().collect();
    let unified = unify_dashes(&nfkc);
    let stripped = strip_noise_brackets(&unified);
    let collapsed = collapse_whitespace(&stripped);
    finish(title_case(&collapsed))
}

/// Normalize an artist credit. Same as titles but brackets are never
/// stripped: collaboration credits are handled by the splitter.
pub fn normalize_artist(artist: &str) -> NormalizedText {
    let nfkc: String = artist.nfkc().collect();
    let unified = unify_dashes(&nfkc);
    let collapsed = collapse_whitespace(&unified);
    finish(title_case(&collapsed))
}

/// Pick the display form to store when a library string and a scraped
/// string normalize to the same key: the library's styling wins.
pub fn prefer_library_style(library_display: &str, scraped_display: &str) -> String {
    if comparison_key(library_display) == comparison_key(scraped_display) {
        library_display.to_string()
    } else {
        scraped_display.to_string()
    }
}

// ============================================================================
// SCRAPE FILTERS
// ============================================================================

/// Minimum length of a normalized artist or title worth resolving.
pub const MIN_FIELD_CHARS: usize = 3;

/// Station IDs, ads and other non-song entries that show up in now-playing feeds.
pub static NON_SONG_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)\b(?:advertisement|commercial|sponsored|promo)\b").unwrap(),
        Regex::new(r"(?i)\b(?:station\s+id|sweeper|jingle|traffic\s+(?:and|&)\s+weather)\b").unwrap(),
        Regex::new(r"(?i)\byou'?re\s+listening\s+to\b").unwrap(),
        Regex::new(r"(?i)\b(?:call|text)\s+us\b").unwrap(),
        Regex::new(r"(?i)(?:www\.|https?://|\.com\b)").unwrap(),
    ]
});

/// True when a scraped (artist, title) pair should be dropped before resolution.
pub fn should_skip_play(artist: &NormalizedText, title: &NormalizedText) -> bool {
    if artist.display.chars().count() < MIN_FIELD_CHARS
        || title.display.chars().count() < MIN_FIELD_CHARS
    {
        return true;
    }
    NON_SONG_PATTERNS
        .iter()
        .any(|re| re.is_match(&artist.display) || re.is_match(&title.display))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_title_strips_noise() {
        assert_eq!(normalize_title("ANTI-HERO (CLEAN)").display, "Anti-Hero");
        assert_eq!(normalize_title("Anti-Hero (Clean Edit)").display, "Anti-Hero");
        assert_eq!(normalize_title("Kill Bill [Explicit]").display, "Kill Bill");
        assert_eq!(normalize_title("Espresso (feat. Someone) [Radio Edit]").display, "Espresso");
        assert_eq!(normalize_title("Heroes (2017 Remaster)").display, "Heroes");
    }

    #[test]
    fn test_nested_noise_brackets_strip_in_one_pass() {
        assert_eq!(normalize_title("Song (Live (Remix))").display, "Song");
        assert_eq!(normalize_title("Hey Jude ((Remix) Clean)").display, "Hey Jude");
        assert_eq!(strip_noise_brackets("Song (Part (Remix) Two)"), "Song (Part Two)");
    }

    #[test]
    fn test_normalize_title_keeps_real_parentheticals() {
        assert_eq!(
            normalize_title("(I Can't Get No) Satisfaction").display,
            "(I Can't Get No) Satisfaction"
        );
        assert_eq!(normalize_title("Live Forever").display, "Live Forever");
        assert_eq!(normalize_title("Song (Live Forever)").display, "Song (Live Forever)");
        assert_eq!(normalize_title("(Remix)").display, "(Remix)");
    }

    #[test]
    fn test_title_case_all_caps() {
        assert_eq!(normalize_title("THE SOUND OF SILENCE").display, "The Sound of Silence");
        assert_eq!(normalize_title("AIN'T NO MOUNTAIN HIGH ENOUGH").display, "Ain't No Mountain High Enough");
        assert_eq!(normalize_title("SK8ER BOI").display, "Sk8er Boi");
        assert_eq!(normalize_title("ROCKY II THEME").display, "Rocky II Theme");
        assert_eq!(normalize_artist("TAYLOR SWIFT FEAT. SZA").display, "Taylor Swift feat. SZA");
        assert_eq!(normalize_artist("AC/DC").display, "AC/DC");
        assert_eq!(normalize_artist("r.e.m.").display, "R.E.M.");
    }

    #[test]
    fn test_title_case_all_lowercase() {
        assert_eq!(normalize_title("hey jude").display, "Hey Jude");
        assert_eq!(normalize_artist("of monsters and men").display, "Of Monsters and Men");
        assert_eq!(normalize_artist("deadmau5").display, "Deadmau5");
        assert_eq!(normalize_artist("blink-182").display, "Blink-182");
    }

    #[test]
    fn test_mixed_case_untouched() {
        assert_eq!(normalize_artist("P!nk").display, "P!nk");
        assert_eq!(normalize_artist("MGMT and friends").display, "MGMT and friends");
        assert_eq!(normalize_title("iPhone Song").display, "iPhone Song");
    }

    #[test]
    fn test_whitespace_and_dashes() {
        assert_eq!(normalize_title("  Hello \t  World ").display, "Hello World");
        assert_eq!(normalize_title("Anti\u{2010}Hero").display, "Anti-Hero");
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(normalize_title(""), NormalizedText::default());
        assert_eq!(normalize_artist("   "), NormalizedText::default());
    }

    #[test]
    fn test_apostrophe_invariance() {
        assert_eq!(
            normalize_artist("Ain't It Fun").comparison_key,
            normalize_artist("Ain\u{2019}t It Fun").comparison_key
        );
        // Display keeps the scraped style
        assert_eq!(normalize_artist("Ain\u{2019}t It Fun").display, "Ain\u{2019}t It Fun");
    }

    #[test]
    fn test_comparison_key() {
        assert_eq!(normalize_artist("Beyoncé").comparison_key, "beyonce");
        assert_eq!(normalize_artist("Simon & Garfunkel").comparison_key, "simon and garfunkel");
        assert_eq!(normalize_title("Rock''n Roll").comparison_key, "rock'n roll");
    }

    #[test]
    fn test_normalize_title_idempotent() {
        let samples = [
            "ANTI-HERO (CLEAN)",
            "(I Can't Get No) Satisfaction",
            "the sound of silence",
            "abba",
            "a",
            "ii",
            "(REMIX)",
            "Ain\u{2019}t  It   Fun [Explicit]",
            "ＦＵＬＬＷＩＤＴＨ",
            "Café del Mar (Radio Edit)",
            "",
            "I II III",
            "ROCK-N-ROLL / AC/DC",
            "Song (Live (Remix))",
            "Hey Jude ((Remix) Clean)",
            "((Remix) Clean)",
        ];
        for s in samples {
            let once = normalize_title(s);
            let twice = normalize_title(&once.display);
            assert_eq!(once, twice, "not idempotent for {:?}", s);
        }
    }

    #[test]
    fn test_prefer_library_style() {
        assert_eq!(
            prefer_library_style("Don\u{2019}t Stop Me Now", "DON'T STOP ME NOW"),
            "Don\u{2019}t Stop Me Now"
        );
        assert_eq!(prefer_library_style("Other Song", "Don't Stop"), "Don't Stop");
    }

    #[test]
    fn test_should_skip_play() {
        let artist = normalize_artist("Taylor Swift");
        assert!(!should_skip_play(&artist, &normalize_title("Anti-Hero")));
        assert!(should_skip_play(&artist, &normalize_title("Hi")));
        assert!(should_skip_play(&normalize_artist("KISS 108"), &normalize_title("You're listening to KISS 108")));
        assert!(should_skip_play(&normalize_artist("Station"), &normalize_title("Commercial Break")));
    }
}
