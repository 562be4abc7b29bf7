use tokio::sync::oneshot;

use crate::model::*;

use super::{Engine, EngineError, WalCommand};

impl Engine {
    /// Rewrite the WAL as the shortest event sequence that recreates current state.
    ///
    /// Holds the catalog lock for writing and every resource's state lock for
    /// reading until the new log is in place, so no append can slip between
    /// the snapshot and the swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.write().await;

        let mut states: Vec<_> = self
            .resources
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        states.sort_by_key(|(id, _)| *id);
        let mut guards = Vec::with_capacity(states.len());
        for (_, rs) in &states {
            guards.push(rs.clone().read_owned().await);
        }

        let mut events: Vec<Event> = Vec::new();
        events.extend(
            self.list_categories()
                .into_iter()
                .map(|category| Event::CategoryCreated { category }),
        );
        events.extend(
            self.list_projects()
                .into_iter()
                .map(|project| Event::ProjectCreated { project }),
        );
        events.extend(
            self.list_users()
                .into_iter()
                .map(|user| Event::UserCreated { user }),
        );
        for guard in &guards {
            events.push(Event::ResourceCreated {
                resource: guard.resource.clone(),
            });
        }
        for guard in &guards {
            events.extend(guard.allocations.iter().map(|a| Event::AllocationCreated {
                allocation: a.clone(),
            }));
            events.extend(guard.windows.iter().map(|w| Event::MaintenanceCreated {
                window: w.clone(),
            }));
        }

        let event_count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::info!("WAL compacted to {event_count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
