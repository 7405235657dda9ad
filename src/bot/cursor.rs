use crate::line_store::{LineRecord, Lines};

/// Contents of the bot file: token, an optional note and the delivery cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotCredentials {
    pub token: String,
    /// Free-form second line, usually the admin chat id.
    pub note: Option<String>,
    /// Id of the last update handed to the dispatcher. Never decreases.
    pub cursor: i64,
}

impl LineRecord for BotCredentials {
    const LINES: usize = 3;

    fn from_lines(lines: &Lines) -> Option<Self> {
        Some(Self {
            token: lines.get(0)?.to_string(),
            note: lines.get(1).map(str::to_string),
            cursor: lines.parse(2).unwrap_or(0),
        })
    }

    fn to_lines(&self) -> Vec<String> {
        vec![
            self.token.clone(),
            self.note.clone().unwrap_or_default(),
            self.cursor.to_string(),
        ]
    }
}
