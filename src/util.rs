use std::future::Future;

macro_rules! ensure {
    ($cond:expr_2021, $err:expr_2021 $(,)?) => {
        if !$cond {
            return std::result::Result::Err($err.into());
        }
    };
}

macro_rules! bail {
    ($err:expr_2021 $(,)?) => {{
        return std::result::Result::Err($err.into());
    }};
}

/// Add one to a big-endian number, wrapping at the top. Same as libsodium's `sodium_increment`,
/// but big-endian like the transit nonces.
pub fn sodium_increment_be(n: &mut [u8]) {
    let mut c = 1u16;
    for b in n.iter_mut().rev() {
        c += *b as u16;
        *b = c as u8;
        c >>= 8;
    }
}

/// Random hex string of `len` bytes, used for sides and message ids
pub fn random_hex(len: usize) -> String {
    let bytes: Vec<u8> = (0..len).map(|_| rand::random::<u8>()).collect();
    hex::encode(bytes)
}

/// The error type returned by [`timeout`]
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("Timed out")]
pub struct TimeoutError;

/// Utility function to add a timeout to a future
///
/// This behaves the same as async std timeout, but with async-io
pub fn timeout<'a, R, F: Future<Output = R> + 'a>(
    timeout: std::time::Duration,
    future: F,
) -> impl Future<Output = Result<R, TimeoutError>> + 'a {
    let timeout_future = async move {
        async_io::Timer::after(timeout).await;
        Err(TimeoutError)
    };

    futures_lite::future::or(async { Ok(future.await) }, timeout_future)
}

/// Indicator that a [`cancellable`] task was cancelled.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("Task has been cancelled")]
pub struct Cancelled;

/// An `Abortable` whose abort handle is a future: whichever of the two resolves first wins.
///
/// Dropping the losing `future` is what cancels it, so every `.await` inside it is a cancellation point.
pub async fn cancellable<T>(
    future: impl Future<Output = T> + Unpin,
    cancel: impl Future<Output = ()> + Unpin,
) -> Result<T, Cancelled> {
    use futures::future::Either;
    match futures::future::select(cancel, future).await {
        Either::Left(((), _)) => Err(Cancelled),
        Either::Right((val, _)) => Ok(val),
    }
}
