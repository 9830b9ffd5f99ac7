pub(super) mod completion;
pub(crate) mod data_source;
pub(super) mod flush;
pub(super) mod lifecycle;
pub(super) mod queue;
pub(crate) mod slots;
pub(super) mod submission;
pub(super) mod worker;
#[cfg(test)]
mod test_util;
