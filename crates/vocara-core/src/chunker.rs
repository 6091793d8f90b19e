//! Splits scripts into voice-service-sized units on sentence boundaries.
//!
//! The voice service caps a single synthesis request by token count.
//! Tokens are approximated as `ceil(chars / 3)`, so a cap of C tokens
//! becomes a budget of `3 * C` characters per chunk.

/// Default per-request token cap of the voice service.
pub const DEFAULT_TOKEN_CAP: usize = 200;

/// Ordered fragments for one audio job, each within the token cap (except
/// a single word that alone exceeds the character budget, which is emitted
/// whole rather than split mid-word).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    pub fragments: Vec<String>,
    pub token_cap: usize,
}

impl ChunkPlan {
    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }
}

/// Approximate token count of a fragment.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(3)
}

/// Plan chunks for `text` under a cap of `token_cap` tokens per chunk.
pub fn plan(text: &str, token_cap: usize) -> ChunkPlan {
    let max_chars = token_cap.max(1) * 3;
    let mut fragments = Vec::new();

    let mut current = String::new();
    let mut current_chars = 0usize;

    for sentence in split_sentences(text) {
        let sentence_chars = sentence.chars().count();

        if sentence_chars > max_chars {
            flush(&mut fragments, &mut current, &mut current_chars);
            for piece in split_overlong_sentence(&sentence, max_chars) {
                fragments.push(terminate(piece));
            }
            continue;
        }

        let sep = if current.is_empty() { 0 } else { 1 };
        if current_chars + sep + sentence_chars <= max_chars {
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(&sentence);
            current_chars += sep + sentence_chars;
        } else {
            flush(&mut fragments, &mut current, &mut current_chars);
            current.push_str(&sentence);
            current_chars = sentence_chars;
        }
    }
    flush(&mut fragments, &mut current, &mut current_chars);

    ChunkPlan {
        fragments,
        token_cap,
    }
}

/// Sentences with their terminating punctuation kept attached; empties
/// (runs of punctuation or whitespace) are dropped.
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();

    for ch in text.chars() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?') {
            push_trimmed(&mut sentences, &mut current);
        }
    }
    push_trimmed(&mut sentences, &mut current);
    sentences
}

fn push_trimmed(sentences: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() && trimmed.chars().any(|c| !matches!(c, '.' | '!' | '?')) {
        sentences.push(trimmed.to_string());
    }
    current.clear();
}

/// Greedy word packing for a sentence longer than the character budget.
/// A single word over the budget is emitted as its own piece; the voice
/// service degrades more gracefully on a long token than on a word cut
/// in half.
fn split_overlong_sentence(sentence: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0usize;

    for word in sentence.split_whitespace() {
        let word_chars = word.chars().count();

        if word_chars > max_chars {
            if !current.is_empty() {
                pieces.push(std::mem::take(&mut current));
                current_chars = 0;
            }
            pieces.push(word.to_string());
            continue;
        }

        let sep = if current.is_empty() { 0 } else { 1 };
        if current_chars + sep + word_chars <= max_chars {
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
            current_chars += sep + word_chars;
        } else {
            pieces.push(std::mem::take(&mut current));
            current.push_str(word);
            current_chars = word_chars;
        }
    }

    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

fn flush(fragments: &mut Vec<String>, current: &mut String, current_chars: &mut usize) {
    if !current.is_empty() {
        fragments.push(terminate(std::mem::take(current)));
        *current_chars = 0;
    }
}

/// Chunks are spoken independently; a trailing period keeps the voice
/// model's prosody from running the chunk into the next one.
fn terminate(mut fragment: String) -> String {
    if !fragment.ends_with(['.', '!', '?']) {
        fragment.push('.');
    }
    fragment
}
