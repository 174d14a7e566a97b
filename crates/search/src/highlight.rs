//! Case- and accent-insensitive substring matching with HTML highlighting.
//!
//! Both sides are folded one character at a time: canonical decomposition,
//! combining marks dropped, lowercased, final sigma treated as sigma, and
//! katakana and small kana mapped onto full-size hiragana. Matching happens on
//! the folded text, but the highlight is cut from the unfolded text so the caller
//! sees the title exactly as stored.

use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

const HIGHLIGHT_OPEN: &str = "<b>";
const HIGHLIGHT_CLOSE: &str = "</b>";

/// Find the first occurrence of `query` in `text` and return `text`
/// HTML-escaped with that occurrence wrapped in `<b>`.
///
/// An empty query matches any text and yields an empty highlight. `None`
/// means no match.
pub fn find_and_highlight(text: &str, query: &str) -> Option<String> {
    if query.is_empty() {
        return Some(String::new());
    }
    let needle: Vec<char> = query.chars().flat_map(fold).collect();
    if needle.is_empty() {
        return None;
    }

    let chars: Vec<(usize, char)> = text.char_indices().collect();
    // Folded haystack, with the index into `chars` each folded char came from.
    let mut haystack = Vec::with_capacity(chars.len());
    let mut origin = Vec::with_capacity(chars.len());
    for (index, (_, c)) in chars.iter().enumerate() {
        for folded in fold(*c) {
            haystack.push(folded);
            origin.push(index);
        }
    }

    let start = haystack.windows(needle.len()).position(|window| window == needle.as_slice())?;
    let first = origin[start];
    let mut last = origin[start + needle.len() - 1] + 1;
    // Marks that fold away still belong to the matched character.
    while last < chars.len() && fold(chars[last].1).next().is_none() {
        last += 1;
    }

    let byte = |index: usize| chars.get(index).map_or(text.len(), |(offset, _)| *offset);
    let (from, to) = (byte(first), byte(last));
    let mut highlighted = String::with_capacity(text.len() + HIGHLIGHT_OPEN.len() + HIGHLIGHT_CLOSE.len());
    escape_html_into(&text[..from], &mut highlighted);
    highlighted.push_str(HIGHLIGHT_OPEN);
    escape_html_into(&text[from..to], &mut highlighted);
    highlighted.push_str(HIGHLIGHT_CLOSE);
    escape_html_into(&text[to..], &mut highlighted);
    Some(highlighted)
}

fn fold(c: char) -> impl Iterator<Item = char> {
    std::iter::once(c)
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .map(fold_kana)
        .map(|c| if c == 'ς' { 'σ' } else { c })
        .collect::<Vec<_>>()
        .into_iter()
}

fn fold_kana(c: char) -> char {
    // Katakana ァ..ヶ sit exactly 0x60 above their hiragana counterparts.
    let c = match c {
        '\u{30A1}'..='\u{30F6}' => char::from_u32(c as u32 - 0x60).unwrap_or(c),
        _ => c,
    };
    match c {
        'ぁ' => 'あ',
        'ぃ' => 'い',
        'ぅ' => 'う',
        'ぇ' => 'え',
        'ぉ' => 'お',
        'っ' => 'つ',
        'ゃ' => 'や',
        'ゅ' => 'ゆ',
        'ょ' => 'よ',
        'ゎ' => 'わ',
        'ゕ' => 'か',
        'ゖ' => 'け',
        _ => c,
    }
}

fn escape_html_into(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
}
