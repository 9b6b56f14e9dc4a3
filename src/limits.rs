/// Max candidates accepted by one batch call (bookings or payments).
pub const MAX_BATCH_SIZE: usize = 10_000;

/// Max byte length of a payment method name.
pub const MAX_METHOD_LEN: usize = 64;

/// Max byte length of a settlement reference.
pub const MAX_REFERENCE_LEN: usize = 128;

/// Capacity of the WAL writer command channel.
pub const WAL_CHANNEL_CAPACITY: usize = 4096;
