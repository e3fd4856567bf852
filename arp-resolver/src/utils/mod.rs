/// Helpers for tests and demos that drive an engine over a `ChannelTransport`.
pub mod test;
