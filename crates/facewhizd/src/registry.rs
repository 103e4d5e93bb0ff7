use facewhiz_core::{resolve_threshold_or, NewPerson, Person, PersonProfile, Recognition};
use facewhiz_store::{RegistryStats, Store, StoreError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to spawn registry thread: {0}")]
    Spawn(std::io::Error),
    #[error("registry thread exited")]
    ChannelClosed,
}

type Reply<T> = oneshot::Sender<Result<T, StoreError>>;

/// Messages sent from D-Bus handlers to the registry thread.
enum RegistryRequest {
    CreatePerson {
        attrs: NewPerson,
        descriptor: Option<Vec<f32>>,
        reply: Reply<Person>,
    },
    AddDescriptor {
        person_id: String,
        values: Vec<f32>,
        reply: Reply<String>,
    },
    GetPerson {
        person_id: String,
        reply: Reply<PersonProfile>,
    },
    ListPeople {
        reply: Reply<Vec<Person>>,
    },
    DeletePerson {
        person_id: String,
        reply: Reply<()>,
    },
    Recognize {
        query: Vec<f32>,
        threshold: f32,
        reply: Reply<Recognition>,
    },
    Stats {
        reply: Reply<RegistryStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Clone-safe handle to the registry thread.
///
/// The thread owns the only [`Store`], so requests from every handle are
/// applied one at a time in arrival order.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<RegistryRequest>,
    default_threshold: f32,
}

impl RegistryHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> RegistryRequest,
    ) -> Result<T, RegistryError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| RegistryError::ChannelClosed)??)
    }

    pub async fn create_person(
        &self,
        attrs: NewPerson,
        descriptor: Option<Vec<f32>>,
    ) -> Result<Person, RegistryError> {
        self.call(|reply| RegistryRequest::CreatePerson {
            attrs,
            descriptor,
            reply,
        })
        .await
    }

    pub async fn add_descriptor(
        &self,
        person_id: String,
        values: Vec<f32>,
    ) -> Result<String, RegistryError> {
        self.call(|reply| RegistryRequest::AddDescriptor {
            person_id,
            values,
            reply,
        })
        .await
    }

    pub async fn get_person(&self, person_id: String) -> Result<PersonProfile, RegistryError> {
        self.call(|reply| RegistryRequest::GetPerson { person_id, reply })
            .await
    }

    pub async fn list_people(&self) -> Result<Vec<Person>, RegistryError> {
        self.call(|reply| RegistryRequest::ListPeople { reply }).await
    }

    pub async fn delete_person(&self, person_id: String) -> Result<(), RegistryError> {
        self.call(|reply| RegistryRequest::DeletePerson { person_id, reply })
            .await
    }

    /// Recognize `query`. A missing or NaN threshold uses the configured default.
    pub async fn recognize(
        &self,
        query: Vec<f32>,
        threshold: Option<f32>,
    ) -> Result<Recognition, RegistryError> {
        let threshold = resolve_threshold_or(threshold, self.default_threshold);
        self.call(|reply| RegistryRequest::Recognize {
            query,
            threshold,
            reply,
        })
        .await
    }

    pub async fn stats(&self) -> Result<RegistryStats, RegistryError> {
        self.call(|reply| RegistryRequest::Stats { reply }).await
    }

    /// Ask the thread to close the store and exit. Waits until it has.
    pub async fn shutdown(&self) -> Result<(), RegistryError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(RegistryRequest::Shutdown { reply: reply_tx })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;
        reply_rx.await.map_err(|_| RegistryError::ChannelClosed)
    }
}

/// Spawn the registry on a dedicated OS thread that owns `store`.
///
/// The thread closes the store when it receives a shutdown request or
/// when every handle has been dropped.
pub fn spawn_registry(
    mut store: Store,
    queue: usize,
    default_threshold: f32,
) -> Result<RegistryHandle, RegistryError> {
    let (tx, mut rx) = mpsc::channel::<RegistryRequest>(queue.max(1));

    std::thread::Builder::new()
        .name("facewhiz-registry".into())
        .spawn(move || {
            tracing::info!("registry thread started");
            let mut shutdown_reply = None;
            while let Some(req) = rx.blocking_recv() {
                match req {
                    RegistryRequest::Shutdown { reply } => {
                        shutdown_reply = Some(reply);
                        break;
                    }
                    req => handle(&mut store, req),
                }
            }
            if let Err(e) = store.close() {
                tracing::error!(error = %e, "failed to close descriptor store");
            }
            if let Some(reply) = shutdown_reply {
                let _ = reply.send(());
            }
            tracing::info!("registry thread exiting");
        })
        .map_err(RegistryError::Spawn)?;

    Ok(RegistryHandle {
        tx,
        default_threshold,
    })
}

fn handle(store: &mut Store, req: RegistryRequest) {
    match req {
        RegistryRequest::CreatePerson {
            attrs,
            descriptor,
            reply,
        } => {
            let _ = reply.send(store.create_person(attrs, descriptor));
        }
        RegistryRequest::AddDescriptor {
            person_id,
            values,
            reply,
        } => {
            let _ = reply.send(store.add_descriptor(&person_id, values));
        }
        RegistryRequest::GetPerson { person_id, reply } => {
            let _ = reply.send(store.get_person(&person_id));
        }
        RegistryRequest::ListPeople { reply } => {
            let _ = reply.send(store.list_people());
        }
        RegistryRequest::DeletePerson { person_id, reply } => {
            let _ = reply.send(store.delete_person(&person_id));
        }
        RegistryRequest::Recognize {
            query,
            threshold,
            reply,
        } => {
            let _ = reply.send(store.recognize(&query, Some(threshold)));
        }
        RegistryRequest::Stats { reply } => {
            let _ = reply.send(store.stats());
        }
        RegistryRequest::Shutdown { reply } => {
            let _ = reply.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(len: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; len];
        v[hot] = 1.0;
        v
    }

    fn registry() -> RegistryHandle {
        spawn_registry(Store::open_in_memory().unwrap(), 4, 0.5).unwrap()
    }

    #[tokio::test]
    async fn test_register_and_recognize() {
        let registry = registry();
        let person = registry
            .create_person(NewPerson::named("Ada"), Some(unit(128, 0)))
            .await
            .unwrap();

        let result = registry.recognize(unit(128, 0), None).await.unwrap();
        assert_eq!(result.person.map(|p| p.id), Some(person.id));
        assert_eq!(result.distance, Some(0.0));
        assert_eq!(result.threshold, 0.5);
    }

    #[tokio::test]
    async fn test_configured_default_threshold() {
        let registry = spawn_registry(Store::open_in_memory().unwrap(), 4, 2.0).unwrap();
        registry
            .create_person(NewPerson::named("Far"), Some(unit(128, 0)))
            .await
            .unwrap();

        let loose = registry.recognize(unit(128, 1), None).await.unwrap();
        assert!(loose.person.is_some());
        assert_eq!(loose.threshold, 2.0);

        let strict = registry.recognize(unit(128, 1), Some(0.5)).await.unwrap();
        assert!(strict.person.is_none());

        let nan = registry.recognize(unit(128, 1), Some(f32::NAN)).await.unwrap();
        assert_eq!(nan.threshold, 2.0);
    }

    #[tokio::test]
    async fn test_store_errors_pass_through() {
        let registry = registry();
        let err = registry
            .add_descriptor("missing".into(), unit(128, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Store(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_concurrent_delete_and_attach_stay_consistent() {
        let registry = registry();
        let person = registry
            .create_person(NewPerson::named("Racy"), Some(unit(128, 0)))
            .await
            .unwrap();

        let (deleted, attached) = tokio::join!(
            registry.delete_person(person.id.clone()),
            registry.add_descriptor(person.id.clone(), unit(128, 1)),
        );
        deleted.unwrap();
        match attached {
            Ok(_) => {}
            Err(RegistryError::Store(StoreError::NotFound(_))) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }

        let stats = registry.stats().await.unwrap();
        assert_eq!(stats.people_count, 0);
        assert_eq!(stats.descriptors_count, 0);
    }

    #[tokio::test]
    async fn test_list_people_through_handle() {
        let registry = registry();
        registry.create_person(NewPerson::named("A"), None).await.unwrap();
        registry.create_person(NewPerson::named("B"), None).await.unwrap();
        let names: Vec<_> = registry
            .list_people()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["B", "A"]);
    }

    #[tokio::test]
    async fn test_shutdown_closes_channel() {
        let registry = registry();
        registry.shutdown().await.unwrap();
        assert!(matches!(
            registry.list_people().await,
            Err(RegistryError::ChannelClosed)
        ));
    }
}
