use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum PhonemeTableError {
    #[error("Symbol table read error: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Line {line}: expected \"symbol id\", got {content:?}")]
    ParseError { line: usize, content: String },
}

/// Maps phoneme characters to acoustic-model token ids.
#[derive(Debug, Clone, Default)]
pub struct PhonemeTokenizer {
    token_to_id: HashMap<String, i64>,
    id_to_token: HashMap<i64, String>,
}

impl PhonemeTokenizer {
    pub fn new(table: impl IntoIterator<Item = (String, i64)>) -> Self {
        let mut out = Self::default();
        for (symbol, id) in table {
            out.id_to_token.insert(id, symbol.clone());
            out.token_to_id.insert(symbol, id);
        }
        out
    }

    /// One `symbol id` pair per line. A line holding only an id maps the space character.
    pub fn parse(contents: &str) -> Result<Self, PhonemeTableError> {
        let mut table = vec![];
        for (line_no, line) in contents.lines().enumerate() {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            let parse_error = || PhonemeTableError::ParseError { line: line_no + 1, content: line.to_string() };
            let (symbol, id) = match line.rsplit_once(char::is_whitespace) {
                Some((symbol, id)) if !symbol.is_empty() => (symbol.to_string(), id),
                _ => (" ".to_string(), line.trim()),
            };
            let id = id.parse::<i64>().map_err(|_| parse_error())?;
            table.push((symbol, id));
        }
        Ok(Self::new(table))
    }

    pub fn load(path: &Path) -> Result<Self, PhonemeTableError> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    pub fn num_tokens(&self) -> usize {
        self.id_to_token.keys().max().map(|m| *m as usize + 1).unwrap_or(0)
    }

    pub fn id_to_token(&self, id: i64) -> Option<&str> {
        self.id_to_token.get(&id).map(String::as_str)
    }

    /// ASCII whitespace is dropped; characters missing from the table are logged and skipped.
    pub fn tokenize(&self, phonemes: &str) -> Vec<i64> {
        let mut ids = vec![];
        for c in phonemes.chars().filter(|c| !c.is_ascii_whitespace()) {
            let mut buf = [0u8; 4];
            match self.token_to_id.get(c.encode_utf8(&mut buf) as &str) {
                Some(id) => ids.push(*id),
                None => log::warn!("Phoneme {c:?} (U+{:04X}) is not in the symbol table", c as u32),
            }
        }
        ids
    }
}
