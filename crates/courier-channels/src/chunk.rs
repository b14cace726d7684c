//! Text chunking for platform message-size limits.
//!
//! Splits prefer paragraph breaks, then line breaks, then a hard cut at a
//! char boundary. Chunks are never empty and every chunk fits the limit.

/// Split `text` into chunks of at most `limit` characters.
///
/// `limit == 0` means unlimited. Whitespace-only fragments between breaks
/// are dropped rather than sent as blank messages.
pub fn chunk_text(text: &str, limit: usize) -> Vec<String> {
    if limit == 0 || text.chars().count() <= limit {
        if text.trim().is_empty() {
            return Vec::new();
        }
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let piece = take_chunk(rest, limit);
        let trimmed = piece.trim();
        if !trimmed.is_empty() {
            chunks.push(piece.trim_end().to_string());
        }
        rest = &rest[piece.len()..];
    }
    chunks
}

/// Longest prefix of `text` within `limit` chars, cut at the best break.
fn take_chunk(text: &str, limit: usize) -> &str {
    if text.chars().count() <= limit {
        return text;
    }
    // Byte index of the hard cut point at `limit` chars.
    let hard_cut = text
        .char_indices()
        .nth(limit)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let window = &text[..hard_cut];

    for sep in ["\n\n", "\n", " "] {
        if let Some(pos) = window.rfind(sep) {
            if pos > 0 {
                return &text[..pos + sep.len()];
            }
        }
    }
    window
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(chunk_text("hello", 100), vec!["hello"]);
    }

    #[test]
    fn zero_limit_means_unlimited() {
        let long = "x".repeat(10_000);
        assert_eq!(chunk_text(&long, 0), vec![long.clone()]);
    }

    #[test]
    fn whitespace_only_yields_no_chunks() {
        assert!(chunk_text("   \n\n  ", 100).is_empty());
    }

    #[test]
    fn splits_prefer_paragraph_breaks() {
        let text = format!("{}\n\n{}", "a".repeat(40), "b".repeat(40));
        let chunks = chunk_text(&text, 50);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "a".repeat(40));
        assert_eq!(chunks[1], "b".repeat(40));
    }

    #[test]
    fn every_chunk_fits_the_limit() {
        let text = "word ".repeat(500);
        for chunk in chunk_text(&text, 64) {
            assert!(chunk.chars().count() <= 64, "chunk too long: {chunk:?}");
            assert!(!chunk.trim().is_empty());
        }
    }

    #[test]
    fn hard_cut_respects_char_boundaries() {
        // Multibyte chars must never be split mid-codepoint.
        let text = "é".repeat(100);
        let chunks = chunk_text(&text, 30);
        assert!(chunks.len() >= 4);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 30);
        }
        assert_eq!(chunks.concat(), text);
    }
}
