pub(crate) mod applier;
pub(crate) mod backup;
pub(crate) mod catalog;
pub(crate) mod checksum;
pub(crate) mod extractor;
pub(crate) mod fetcher;
pub(crate) mod installer;
pub(crate) mod lock;
pub(crate) mod orchestrator;
pub(crate) mod release_source;
pub(crate) mod retry;
pub(crate) mod rollback;
pub(crate) mod validator;

#[cfg(test)]
mod tests;
