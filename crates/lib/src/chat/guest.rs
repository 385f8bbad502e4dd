//! Local simulation for guest mode: a canned reply that echoes the user's text,
//! cut into randomly sized pieces to mimic token streaming.

const MIN_PIECE: usize = 6;
const MAX_PIECE: usize = 14;

/// Deterministic demo reply: echo plus a short capability summary.
pub fn demo_reply(text: &str) -> String {
    format!(
        "DEMO: received your message:\n\n{}\n\n\
         This reply was generated locally. Sign in to a backend for real AI answers, \
         token streaming, offline replay, uploads and workspaces.",
        text
    )
}

/// Random piece length in `MIN_PIECE..=MAX_PIECE` characters.
fn piece_len() -> usize {
    let mut b = [0u8; 1];
    if getrandom::getrandom(&mut b).is_err() {
        return MIN_PIECE;
    }
    MIN_PIECE + (b[0] as usize) % (MAX_PIECE - MIN_PIECE + 1)
}

/// Iterator over consecutive pieces of `text`, split on character boundaries.
pub struct Pieces<'a> {
    rest: &'a str,
}

impl<'a> Pieces<'a> {
    pub fn new(text: &'a str) -> Self {
        Self { rest: text }
    }
}

impl<'a> Iterator for Pieces<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        if self.rest.is_empty() {
            return None;
        }
        let n = piece_len();
        let end = self
            .rest
            .char_indices()
            .nth(n)
            .map(|(i, _)| i)
            .unwrap_or(self.rest.len());
        let (piece, rest) = self.rest.split_at(end);
        self.rest = rest;
        Some(piece)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_echoes_input() {
        assert!(demo_reply("hello").contains("hello"));
    }

    #[test]
    fn pieces_cover_text_in_bounded_sizes() {
        let text = demo_reply("проверка юникода ✓");
        let pieces: Vec<&str> = Pieces::new(&text).collect();
        assert_eq!(pieces.concat(), text);
        let (last, init) = pieces.split_last().unwrap();
        for p in init {
            let n = p.chars().count();
            assert!((MIN_PIECE..=MAX_PIECE).contains(&n), "piece of {} chars", n);
        }
        assert!(last.chars().count() <= MAX_PIECE);
    }
}
