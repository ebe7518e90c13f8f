use {
    crate::{
        config::EtcdConfig,
        error::Error,
        retry::retry_etcd,
        store::{Action, ChangeEvent, Precondition, VersionedStore, VersionedValue},
        Version,
    },
    etcd_client::{
        Compare, CompareOp, ConnectOptions, DeleteOptions, EventType, GetOptions, KeyValue,
        PutOptions, Txn, TxnOp, TxnOpResponse, TxnResponse, WatchOptions,
    },
    std::time::Duration,
    tokio_stream::StreamExt,
    tracing::{error, trace, warn},
};

///
/// [`VersionedStore`] over etcd v3.
///
/// Store versions are etcd mod revisions. Preconditions become [`Txn`] guards, TTLs become a lease
/// granted per write, and a watch is a single event pulled from a watch stream opened right after
/// the requested revision. etcd v3 does not distinguish a lease expiry from a delete, both are
/// reported as [`Action::Deleted`].
///
#[derive(Clone)]
pub struct EtcdStore {
    etcd: etcd_client::Client,
}

impl EtcdStore {
    pub fn new(etcd: etcd_client::Client) -> Self {
        Self { etcd }
    }

    pub async fn connect(config: &EtcdConfig) -> Result<Self, Error> {
        config.validate()?;
        let mut opts = ConnectOptions::new();
        if let Some(timeout) = config.connection_timeout() {
            opts = opts.with_connect_timeout(timeout).with_timeout(timeout);
        }
        if let (Some(user), Some(password)) = (&config.username, &config.password) {
            opts = opts.with_user(user.clone(), password.clone());
        }
        let etcd = etcd_client::Client::connect(config.endpoint_urls(), Some(opts)).await?;
        Ok(Self::new(etcd))
    }

    pub fn client(&self) -> &etcd_client::Client {
        &self.etcd
    }

    ///
    /// Pulls the first event strictly after `after` from a watch stream on `key`, or on every key
    /// under it when `prefix` is set.
    ///
    async fn watch_next(
        &self,
        key: &str,
        after: Option<Version>,
        prefix: bool,
    ) -> Result<ChangeEvent, Error> {
        let mut wopts = WatchOptions::new();
        if prefix {
            wopts = wopts.with_prefix();
        }
        if let Some(after) = after {
            wopts = wopts.with_start_revision(after as i64 + 1);
        }
        let (mut watcher, mut stream) = retry_etcd(
            self.etcd.clone(),
            (key.to_string(), wopts),
            |etcd, (key, wopts)| async move { etcd.watch_client().watch(key, Some(wopts)).await },
        )
        .await?;

        let result = loop {
            let Some(watch_resp) = stream.next().await else {
                break Err(Error::WatchEnded);
            };
            let watch_resp = match watch_resp {
                Ok(watch_resp) => watch_resp,
                Err(e) => {
                    error!("watch stream error on {key}: {e:?}");
                    break Err(e.into());
                }
            };
            if watch_resp.canceled() {
                let compacted = watch_resp.compact_revision();
                if compacted > 0 {
                    warn!("watch on {key} fell behind compaction at revision {compacted}");
                    break Err(Error::ResyncRequired(compacted as Version));
                }
                break Err(Error::WatchEnded);
            }
            let Some(event) = watch_resp.events().first() else {
                // Creation acknowledgement or progress notification.
                continue;
            };
            let Some(kv) = event.kv() else {
                continue;
            };
            let event_key = match kv.key_str() {
                Ok(event_key) => event_key.to_string(),
                Err(e) => break Err(e.into()),
            };
            let version = kv.mod_revision() as Version;
            let change = match event.event_type() {
                EventType::Put => {
                    let action = if kv.version() == 1 {
                        Action::Created
                    } else {
                        Action::Updated
                    };
                    to_versioned(kv).map(|value| ChangeEvent {
                        action,
                        key: event_key,
                        value: Some(value),
                        version,
                    })
                }
                EventType::Delete => Ok(ChangeEvent {
                    action: Action::Deleted,
                    key: event_key,
                    value: None,
                    version,
                }),
            };
            break change;
        };
        let _ = watcher.cancel().await;
        result
    }

    async fn grant_ttl(&self, ttl: Duration) -> Result<i64, Error> {
        let ttl_secs = ttl_secs(ttl);
        let lease = retry_etcd(self.etcd.clone(), (), move |mut etcd, _| async move {
            etcd.lease_grant(ttl_secs, None).await
        })
        .await?;
        Ok(lease.id())
    }
}

// etcd leases have a one second granularity, round up so a lease never outlives less than asked.
fn ttl_secs(ttl: Duration) -> i64 {
    let secs = ttl
        .as_secs()
        .saturating_add(u64::from(ttl.subsec_nanos() > 0));
    i64::try_from(secs.max(1)).unwrap_or(i64::MAX)
}

fn guards(key: &str, precondition: &Precondition) -> Vec<Compare> {
    match precondition {
        Precondition::MustNotExist => vec![Compare::version(key, CompareOp::Equal, 0)],
        Precondition::MustExist { version, value } => {
            let mut cmps = vec![Compare::version(key, CompareOp::Greater, 0)];
            if let Some(version) = version {
                cmps.push(Compare::mod_revision(
                    key,
                    CompareOp::Equal,
                    *version as i64,
                ));
            }
            if let Some(value) = value {
                cmps.push(Compare::value(key, CompareOp::Equal, value.clone()));
            }
            cmps
        }
    }
}

///
/// Explains a failed guarded transaction from the `or_else` read of the key.
///
fn precondition_failure(precondition: &Precondition, resp: &TxnResponse) -> Error {
    let exists = resp
        .op_responses()
        .into_iter()
        .any(|op| matches!(op, TxnOpResponse::Get(get) if get.count() > 0));
    match (precondition, exists) {
        (Precondition::MustNotExist, _) => Error::AlreadyExists,
        (_, false) => Error::NotFound,
        (_, true) => Error::VersionConflict,
    }
}

fn header_revision(revision: Option<i64>) -> Result<Version, Error> {
    revision
        .map(|revision| revision as Version)
        .ok_or(Error::UnexpectedResponse("etcd response without header"))
}

fn to_versioned(kv: &KeyValue) -> Result<VersionedValue, Error> {
    Ok(VersionedValue {
        key: kv.key_str()?.to_string(),
        value: kv.value().to_vec(),
        version: kv.mod_revision() as Version,
    })
}

#[async_trait::async_trait]
impl VersionedStore for EtcdStore {
    async fn read(&self, key: &str, consistent: bool) -> Result<VersionedValue, Error> {
        let opts = (!consistent).then(|| GetOptions::new().with_serializable());
        let resp = retry_etcd(
            self.etcd.clone(),
            (key.to_string(), opts),
            |etcd, (key, opts)| async move { etcd.kv_client().get(key, opts).await },
        )
        .await?;
        match resp.kvs().first() {
            Some(kv) => to_versioned(kv),
            None => Err(Error::NotFound),
        }
    }

    async fn current_version(&self) -> Result<Version, Error> {
        let resp = retry_etcd(self.etcd.clone(), (), |etcd, _| async move {
            etcd.kv_client()
                .get("\0", Some(GetOptions::new().with_count_only()))
                .await
        })
        .await?;
        header_revision(resp.header().map(|header| header.revision()))
    }

    async fn write(
        &self,
        key: &str,
        value: Vec<u8>,
        precondition: Option<&Precondition>,
        ttl: Option<Duration>,
    ) -> Result<VersionedValue, Error> {
        let put_opts = match ttl {
            Some(ttl) => Some(PutOptions::new().with_lease(self.grant_ttl(ttl).await?)),
            None => None,
        };
        let put = TxnOp::put(key, value.clone(), put_opts);
        let txn = match precondition {
            Some(precondition) => Txn::new()
                .when(guards(key, precondition))
                .and_then(vec![put])
                .or_else(vec![TxnOp::get(key, None)]),
            None => Txn::new().and_then(vec![put]),
        };
        let resp = self.etcd.kv_client().txn(txn).await?;
        if !resp.succeeded() {
            let err = match precondition {
                Some(precondition) => precondition_failure(precondition, &resp),
                None => Error::UnexpectedResponse("unguarded etcd put reported failure"),
            };
            trace!("conditional write on {key} rejected: {err}");
            return Err(err);
        }
        Ok(VersionedValue {
            key: key.to_string(),
            value,
            version: header_revision(resp.header().map(|header| header.revision()))?,
        })
    }

    async fn delete(&self, key: &str, precondition: Option<&Precondition>) -> Result<(), Error> {
        let must_exist = Precondition::must_exist();
        let precondition = precondition.unwrap_or(&must_exist);
        let txn = Txn::new()
            .when(guards(key, precondition))
            .and_then(vec![TxnOp::delete(key, None)])
            .or_else(vec![TxnOp::get(key, None)]);
        let resp = self.etcd.kv_client().txn(txn).await?;
        if !resp.succeeded() {
            let err = precondition_failure(precondition, &resp);
            trace!("conditional delete on {key} rejected: {err}");
            return Err(err);
        }
        Ok(())
    }

    async fn watch(&self, key: &str, after: Option<Version>) -> Result<ChangeEvent, Error> {
        self.watch_next(key, after, false).await
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        after: Option<Version>,
    ) -> Result<ChangeEvent, Error> {
        self.watch_next(prefix, after, true).await
    }

    async fn list(&self, prefix: &str, consistent: bool) -> Result<Vec<VersionedValue>, Error> {
        let mut opts = GetOptions::new().with_prefix();
        if !consistent {
            opts = opts.with_serializable();
        }
        let resp = retry_etcd(
            self.etcd.clone(),
            (prefix.to_string(), opts),
            |etcd, (prefix, opts)| async move { etcd.kv_client().get(prefix, Some(opts)).await },
        )
        .await?;
        resp.kvs().iter().map(to_versioned).collect()
    }

    async fn delete_tree(&self, prefix: &str) -> Result<(), Error> {
        let resp = self
            .etcd
            .kv_client()
            .delete(prefix, Some(DeleteOptions::new().with_prefix()))
            .await?;
        if resp.deleted() == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }
}
