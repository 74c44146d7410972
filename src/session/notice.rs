/// Suppresses a user notice that repeats the previous one word for word, so a persistent
/// failure is reported once.
#[derive(Debug, Default)]
pub struct NoticeGate {
    last: Option<String>,
}

impl NoticeGate {
    pub fn admit(&mut self, message: &str) -> bool {
        if self.last.as_deref() == Some(message) {
            return false;
        }
        self.last = Some(message.to_string());
        true
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}
