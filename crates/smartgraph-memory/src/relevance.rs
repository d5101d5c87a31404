use std::collections::HashSet;

/// Lowercase alphanumeric tokens of `text`.
pub fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// Number of query tokens that also appear in `fact`.
pub fn relevance_score(fact: &str, query_tokens: &HashSet<String>) -> usize {
    tokenize(fact).intersection(query_tokens).count()
}

/// Facts sharing at least one token with `query`, best overlap first.
///
/// The sort is stable, so facts with equal overlap keep insertion order.
pub fn relevant_facts<'a>(facts: &'a [String], query: &str) -> Vec<&'a str> {
    let query_tokens = tokenize(query);
    if query_tokens.is_empty() {
        return Vec::new();
    }

    let mut scored: Vec<(usize, &str)> = facts
        .iter()
        .map(|f| (relevance_score(f, &query_tokens), f.as_str()))
        .filter(|(score, _)| *score > 0)
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored.into_iter().map(|(_, f)| f).collect()
}

/// Whitespace-delimited word count, the token approximation used for budgets.
pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Cut `text` to at most `max_words` words.
///
/// The cut lands after the last sentence terminator inside the budget; when
/// there is none it falls back to the last whole word. Text already within
/// budget is returned unchanged.
pub fn trim_to_words(text: &str, max_words: usize) -> String {
    let spans = word_spans(text);
    if spans.len() <= max_words {
        return text.to_string();
    }
    if max_words == 0 {
        return String::new();
    }

    let window = &spans[..max_words];
    let cut = window
        .iter()
        .rev()
        .find(|(start, end)| ends_sentence(&text[*start..*end]))
        .or_else(|| window.last())
        .map(|(_, end)| *end)
        .unwrap_or(0);
    text[..cut].to_string()
}

fn ends_sentence(word: &str) -> bool {
    let word = word.trim_end_matches(|c: char| matches!(c, '"' | '\'' | ')' | ']'));
    word.ends_with('.') || word.ends_with('!') || word.ends_with('?')
}

/// Byte ranges of each whitespace-delimited word.
fn word_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start: Option<usize> = None;
    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            if let Some(s) = start.take() {
                spans.push((s, i));
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        spans.push((s, text.len()));
    }
    spans
}
