use std::sync::Arc;

/// Supplies the file extension an artifact gets, e.g. `age` or `tar.age`.
pub trait FileExtProvider {
    fn file_ext(&self) -> Option<Arc<str>>;
}
