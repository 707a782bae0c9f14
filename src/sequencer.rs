use regex::Regex;
use std::sync::LazyLock;

use crate::events::OutboundBubble;

/// Explicit multi-bubble delimiter the agent may emit inside one reply.
pub const BUBBLE_DELIMITER: &str = "|||";

/// One structured piece of an agent reply before pacing metadata is assigned.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyPart {
    Text(String),
    Image(String),
}

fn markdown_image() -> &'static Regex {
    static RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"!\[[^\]]*\]\(([^)]+)\)").expect("Failed to compile markdown image regex")
    });
    &RE
}

/// Split a free-text agent reply into ordered delivery bubbles.
pub fn sequence_reply(reply: &str, bubble_max_chars: usize) -> Vec<OutboundBubble> {
    sequence_parts(&[ReplyPart::Text(reply.to_string())], bubble_max_chars)
}

/// Split structured reply parts into ordered delivery bubbles. Text parts go
/// through the full splitting protocol (delimiter, embedded images, safety
/// re-split); image parts pass through as-is. The last bubble of the whole
/// sequence is the only one flagged `is_final`.
pub fn sequence_parts(parts: &[ReplyPart], bubble_max_chars: usize) -> Vec<OutboundBubble> {
    let mut bubbles = Vec::new();
    for part in parts {
        match part {
            ReplyPart::Image(url) => {
                let url = url.trim();
                if !url.is_empty() {
                    bubbles.push(OutboundBubble::image(url));
                }
            }
            ReplyPart::Text(raw) => {
                for chunk in raw.split(BUBBLE_DELIMITER) {
                    let chunk = chunk.trim();
                    if chunk.is_empty() {
                        continue;
                    }
                    for piece in extract_images(chunk) {
                        match piece {
                            ReplyPart::Image(url) => bubbles.push(OutboundBubble::image(url)),
                            ReplyPart::Text(text) => {
                                for sub in resplit(&text, bubble_max_chars) {
                                    bubbles.push(OutboundBubble::text(sub));
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    finalize(bubbles)
}

fn finalize(mut bubbles: Vec<OutboundBubble>) -> Vec<OutboundBubble> {
    let count = bubbles.len();
    for (idx, bubble) in bubbles.iter_mut().enumerate() {
        bubble.sequence_index = idx;
        bubble.is_final = idx + 1 == count;
    }
    bubbles
}

/// Pull markdown images (`![alt](url)`) out of a chunk, left to right. Text
/// around each image becomes its own piece; alt text is dropped.
fn extract_images(chunk: &str) -> Vec<ReplyPart> {
    let mut pieces = Vec::new();
    let mut cursor = 0;
    for caps in markdown_image().captures_iter(chunk) {
        let (Some(whole), Some(url)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let before = chunk[cursor..whole.start()].trim();
        if !before.is_empty() {
            pieces.push(ReplyPart::Text(before.to_string()));
        }
        let url = url.as_str().trim();
        if !url.is_empty() {
            pieces.push(ReplyPart::Image(url.to_string()));
        }
        cursor = whole.end();
    }
    let after = chunk[cursor..].trim();
    if !after.is_empty() {
        pieces.push(ReplyPart::Text(after.to_string()));
    }
    pieces
}

/// Re-split a text bubble that exceeds the character budget. Sentences are
/// recombined greedily under the budget; a single sentence that alone exceeds
/// it falls back to a hard cut so no content is ever dropped.
fn resplit(text: &str, budget: usize) -> Vec<String> {
    if budget == 0 || text.chars().count() <= budget {
        return vec![text.to_string()];
    }
    let mut out: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0usize;
    for sentence in split_sentences(text) {
        let sentence = sentence.trim();
        if sentence.is_empty() {
            continue;
        }
        let sentence_chars = sentence.chars().count();
        if sentence_chars > budget {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
                current_chars = 0;
            }
            for cut in hard_cut(sentence, budget) {
                let cut = cut.trim();
                if !cut.is_empty() {
                    out.push(cut.to_string());
                }
            }
            continue;
        }
        if current_chars > 0 && current_chars + 1 + sentence_chars > budget {
            out.push(std::mem::take(&mut current));
            current_chars = 0;
        }
        if current.is_empty() {
            current.push_str(sentence);
            current_chars = sentence_chars;
        } else {
            current.push(' ');
            current.push_str(sentence);
            current_chars += 1 + sentence_chars;
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    if out.is_empty() {
        vec![text.to_string()]
    } else {
        out
    }
}

/// Split on runs of `.!?` only when followed by whitespace or end of text, so
/// URLs and decimal numbers never count as boundaries. Each returned slice
/// keeps its terminator.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut iter = text.char_indices().peekable();
    while let Some((idx, ch)) = iter.next() {
        if !matches!(ch, '.' | '!' | '?') {
            continue;
        }
        let mut end = idx + ch.len_utf8();
        while let Some(&(next_idx, next_ch)) = iter.peek() {
            if matches!(next_ch, '.' | '!' | '?') {
                end = next_idx + next_ch.len_utf8();
                iter.next();
            } else {
                break;
            }
        }
        let boundary = match iter.peek() {
            Some(&(_, next_ch)) => next_ch.is_whitespace(),
            None => true,
        };
        if boundary {
            sentences.push(&text[start..end]);
            start = end;
        }
    }
    if start < text.len() {
        sentences.push(&text[start..]);
    }
    sentences
}

/// Cut text into chunks of at most `budget` characters, always on char
/// boundaries. Concatenating the chunks reproduces the input exactly.
fn hard_cut(text: &str, budget: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut count = 0usize;
    for (idx, _) in text.char_indices() {
        if count == budget {
            chunks.push(text[start..idx].to_string());
            start = idx;
            count = 0;
        }
        count += 1;
    }
    if start < text.len() {
        chunks.push(text[start..].to_string());
    }
    chunks
}
