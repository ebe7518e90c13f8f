use {
    retry::delay::Exponential,
    std::{error::Error, future::Future, time::Duration},
    tracing::{error, warn},
};

///
/// Errors caused by forces outside the request itself (leader change, network partition, overload),
/// worth trying again as-is.
///
pub fn is_transient(err: &etcd_client::Error) -> bool {
    use tonic::Code;
    match err {
        etcd_client::Error::GRpcStatus(status) => match status.code() {
            Code::Unknown => status.source().is_none(),
            code => matches!(
                code,
                Code::DeadlineExceeded
                    | Code::ResourceExhausted
                    | Code::Internal
                    | Code::Unavailable
                    | Code::DataLoss
            ),
        },
        etcd_client::Error::TransportError(_) => true,
        _ => false,
    }
}

///
/// Default delays between attempts: 10ms, 100ms, 1s.
///
pub fn default_strategy() -> impl Iterator<Item = Duration> {
    Exponential::from_millis_with_factor(10, 10.0).take(3)
}

///
/// Retry an idempotent etcd operation by capturing reusable args and a closure that computes the future to try.
///
/// Only "transient" errors are retried, meaning errors that happen because of "outside" forces
/// that cannot be prevented such as a network partition.
/// If the error is for example gRPC status "Not found", the function won't retry it.
///
/// Conditional writes must never go through this function: a write that timed out may still have been applied,
/// and replaying it with the same precondition would turn success into a spurious conflict.
///
pub async fn retry_etcd<A, T, F, Fut>(
    etcd: etcd_client::Client,
    reusable_args: A,
    f: F,
) -> Result<T, etcd_client::Error>
where
    A: Clone + Send + 'static,
    Fut: Future<Output = Result<T, etcd_client::Error>> + Send + 'static,
    F: FnMut(etcd_client::Client, A) -> Fut,
    T: Send + 'static,
{
    retry_etcd_with_strategy(etcd, reusable_args, default_strategy(), f).await
}

pub async fn retry_etcd_with_strategy<A, T, F, Fut>(
    etcd: etcd_client::Client,
    reusable_args: A,
    retry_strategy: impl IntoIterator<Item = Duration>,
    mut f: F,
) -> Result<T, etcd_client::Error>
where
    A: Clone + Send + 'static,
    Fut: Future<Output = Result<T, etcd_client::Error>> + Send + 'static,
    F: FnMut(etcd_client::Client, A) -> Fut,
    T: Send + 'static,
{
    let mut delays = retry_strategy.into_iter();
    loop {
        let e = match f(etcd.clone(), reusable_args.clone()).await {
            Ok(o) => return Ok(o),
            Err(e) => e,
        };
        if !is_transient(&e) {
            error!("etcd call failed: {e:?}");
            return Err(e);
        }
        let Some(delay) = delays.next() else {
            warn!("giving up after transient etcd error: {e:?}");
            return Err(e);
        };
        warn!("transient etcd error, retrying in {delay:?}: {e:?}");
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_should_be_transient() {
        let err = etcd_client::Error::GRpcStatus(tonic::Status::unavailable("leader changed"));
        assert!(is_transient(&err));
    }

    #[test]
    fn failed_precondition_should_not_be_transient() {
        let err = etcd_client::Error::GRpcStatus(tonic::Status::failed_precondition("nope"));
        assert!(!is_transient(&err));
        assert!(!is_transient(&etcd_client::Error::InvalidArgs("bad".into())));
    }

    #[test]
    fn default_strategy_should_grow_exponentially() {
        let delays = default_strategy().collect::<Vec<_>>();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(10),
                Duration::from_millis(100),
                Duration::from_millis(1000)
            ]
        );
    }
}
