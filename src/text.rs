//! Comment HTML to encoder-ready sentences.

use scraper::Html;

/// Visible text of an HTML fragment with whitespace collapsed to single spaces.
pub fn html_to_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let mut out = String::with_capacity(html.len());
    for word in fragment
        .root_element()
        .text()
        .flat_map(str::split_whitespace)
    {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    out
}

/// Splits comment HTML into lowercase, punctuation-free sentences.
///
/// Sentences are split on `.`; punctuation in the ASCII ranges `!`..`-`, `:`..`?`,
/// `[`..`` ` `` and `{`..`~` is removed, and sentences left empty are dropped.
pub fn html_to_sentences(html: &str) -> Vec<String> {
    html_to_text(html)
        .split('.')
        .map(clean_sentence)
        .filter(|sentence| !sentence.is_empty())
        .collect()
}

fn clean_sentence(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|ch| !is_stripped_punctuation(*ch))
        .flat_map(char::to_lowercase)
        .collect();
    cleaned.trim().to_string()
}

fn is_stripped_punctuation(ch: char) -> bool {
    matches!(ch as u32, 33..=45 | 58..=63 | 91..=96 | 123..=126)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn strips_markup_and_entities() {
        let text = html_to_text("<p>Rust &amp; <i>Go</i></p><p>compared</p>");
        assert_eq!(text, "Rust & Go compared");
    }

    #[test]
    fn splits_and_cleans_sentences() {
        let html = "<p>Hello, World! This is great.</p><p>Isn't it? (Yes)</p>.";
        assert_eq!(
            html_to_sentences(html),
            vec!["hello world this is great", "isnt it yes"]
        );
    }

    #[test]
    fn keeps_slashes_and_at_signs() {
        // '/' (47) and '@' (64) sit outside the stripped ranges
        assert_eq!(html_to_sentences("a/b @c"), vec!["a/b @c"]);
    }

    #[test]
    fn empty_or_punctuation_only_text_has_no_sentences() {
        assert!(html_to_sentences("").is_empty());
        assert!(html_to_sentences("<p>...</p><p> !? </p>").is_empty());
        assert!(html_to_sentences("<br><br>").is_empty());
    }
}
