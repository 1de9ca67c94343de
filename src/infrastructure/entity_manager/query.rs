// Query execution - remote through the data service, or against the cache
use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use super::merge::MergeSession;
use super::{EntityManager, WriteContext};
use crate::config::FetchStrategy;
use crate::core::entity_key::EntityKey;
use crate::core::entity_state::EntityState;
use crate::core::strong_types::EntityId;
use crate::error::{AppError, AppResult, TransportContext};
use crate::infrastructure::traits::{DataServiceAdapter, QueryResult};
use crate::query::entity_query::{EntityQuery, QueryRow};
use crate::query::select::{ProjectedValue, SelectClause};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOutcome {
    pub results: Vec<QueryRow>,
    /// Total matches before paging, when requested.
    pub inline_count: Option<usize>,
    pub from_cache: bool,
    /// Wire query sent to the server; `None` for local execution.
    pub uri: Option<String>,
}

impl QueryOutcome {
    pub fn entities(&self) -> Vec<EntityId> {
        self.results.iter().filter_map(QueryRow::as_entity).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchByKeyResult {
    pub entity: Option<EntityId>,
    pub from_cache: bool,
}

pub(crate) enum QueryPlan {
    Local(QueryOutcome),
    Remote {
        uri: String,
        adapter: Arc<dyn DataServiceAdapter>,
    },
}

impl EntityManager {
    /// Run a query, fetching metadata first when the service has not been
    /// described yet.
    #[instrument(skip(self, query), fields(manager = %self.id))]
    pub async fn execute_query(&mut self, query: &EntityQuery) -> AppResult<QueryOutcome> {
        if self.needs_metadata() {
            self.fetch_metadata().await?;
        }
        match self.plan_query(query)? {
            QueryPlan::Local(outcome) => Ok(outcome),
            QueryPlan::Remote { uri, adapter } => {
                let raw = adapter.execute_query(&uri).await;
                self.complete_remote_query(query, uri, raw)
            }
        }
    }

    pub(crate) fn plan_query(&self, query: &EntityQuery) -> AppResult<QueryPlan> {
        let strategy = query
            .fetch_strategy()
            .unwrap_or(self.config.query_options.fetch_strategy);
        match strategy {
            FetchStrategy::FromLocalCache => Ok(QueryPlan::Local(self.execute_query_locally(query)?)),
            FetchStrategy::FromServer => {
                let adapter = self.require_data_service()?;
                let uri = query.to_uri(&self.metadata)?;
                debug!(uri = %uri, "remote query planned");
                Ok(QueryPlan::Remote { uri, adapter })
            }
        }
    }

    pub(crate) fn complete_remote_query(
        &mut self,
        query: &EntityQuery,
        uri: String,
        raw: anyhow::Result<QueryResult>,
    ) -> AppResult<QueryOutcome> {
        let result = raw.map_err(|e| {
            warn!(uri = %uri, error = %e, "query failed");
            AppError::transport(TransportContext::Query { uri: uri.clone() }, e)
        })?;
        let rows = self.results_adapter.extract_results(result.results);
        let strategy = query
            .merge_strategy()
            .unwrap_or(self.config.query_options.merge_strategy);
        let entity_type = query
            .resolve_entity_type(&self.metadata)
            .ok()
            .map(|et| et.short_name.clone());
        let mut session = MergeSession::for_query(strategy, entity_type);
        let results = self.merge_payload_rows(rows, &mut session)?;

        if self.config.validation_options.validate_on_query {
            for id in session.entities().to_vec() {
                self.validate_entity(id)?;
            }
        }
        info!(uri = %uri, rows = results.len(), "query executed");
        Ok(QueryOutcome {
            results,
            inline_count: result.inline_count,
            from_cache: false,
            uri: Some(uri),
        })
    }

    /// Evaluate a query against cached, non-deleted entities.
    pub fn execute_query_locally(&self, query: &EntityQuery) -> AppResult<QueryOutcome> {
        let et = query.resolve_entity_type(&self.metadata)?;
        let type_name = et.short_name.as_str();
        let options = self.config.local_query_comparison;
        let predicate = query
            .where_clause()
            .map(|p| p.to_function(type_name, &self.metadata, &options))
            .transpose()?;
        let comparer = query
            .order_by_clause()
            .map(|o| o.to_comparer(type_name, &self.metadata, &options))
            .transpose()?;
        if let Some(select) = query.select_clause() {
            select.validate(type_name, &self.metadata)?;
        }

        let mut ids: Vec<EntityId> = self
            .get_entities(
                Some(&[type_name]),
                Some(&[EntityState::Unchanged, EntityState::Added, EntityState::Modified]),
            )
            .into_iter()
            .filter(|id| predicate.as_ref().map_or(true, |f| f(&self.view(*id))))
            .collect();
        if let Some(cmp) = &comparer {
            ids.sort_by(|a, b| cmp(&self.view(*a), &self.view(*b)));
        }
        let inline_count = query.has_inline_count().then_some(ids.len());
        let page: Vec<EntityId> = ids
            .into_iter()
            .skip(query.skip_count().unwrap_or(0))
            .take(query.take_count().unwrap_or(usize::MAX))
            .collect();

        let results = match query.select_clause() {
            Some(select) => page
                .into_iter()
                .map(|id| self.project(id, select).map(QueryRow::Projection))
                .collect::<AppResult<Vec<_>>>()?,
            None => page.into_iter().map(QueryRow::Entity).collect(),
        };
        Ok(QueryOutcome {
            results,
            inline_count,
            from_cache: true,
            uri: None,
        })
    }

    fn project(
        &self,
        id: EntityId,
        select: &SelectClause,
    ) -> AppResult<BTreeMap<String, ProjectedValue>> {
        let et = self.entity_type_of(id)?;
        let mut fields = BTreeMap::new();
        for path in select.paths() {
            let resolved = self.metadata.resolve_property_path(&et.short_name, path)?;
            let value = if resolved.data_type.is_some() {
                ProjectedValue::Value(self.get_property_value(id, path)?)
            } else {
                let (prefix, last) = match path.rsplit_once('.') {
                    Some((prefix, last)) => (Some(prefix), last),
                    None => (None, path.as_str()),
                };
                let owner = match prefix {
                    Some(prefix) => self.follow_path(id, prefix)?,
                    None => Some(id),
                };
                match (owner, resolved.is_scalar) {
                    (Some(owner), true) => ProjectedValue::Entity(self.relations.scalar(owner, last)),
                    (Some(owner), false) => {
                        ProjectedValue::Entities(self.relations.collection(owner, last).to_vec())
                    }
                    (None, true) => ProjectedValue::Entity(None),
                    (None, false) => ProjectedValue::Entities(Vec::new()),
                }
            };
            fields.insert(SelectClause::projected_name(path), value);
        }
        Ok(fields)
    }

    fn follow_path(&self, id: EntityId, path: &str) -> AppResult<Option<EntityId>> {
        let mut current = id;
        for segment in path.split('.') {
            match self.get_navigation(current, segment)? {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// Cache first (unless deleted) when `check_local_cache_first`, then the server.
    #[instrument(skip(self, key), fields(manager = %self.id, key = %key))]
    pub async fn fetch_entity_by_key(
        &mut self,
        key: &EntityKey,
        check_local_cache_first: bool,
    ) -> AppResult<FetchByKeyResult> {
        if check_local_cache_first {
            if let Some(id) = self.get_entity_by_key(key) {
                if !self.entity_state(id)?.is_deleted() {
                    return Ok(FetchByKeyResult {
                        entity: Some(id),
                        from_cache: true,
                    });
                }
            }
        }
        if self.needs_metadata() {
            self.fetch_metadata().await?;
        }
        let query = EntityQuery::from_entity_key(key, &self.metadata)?
            .using_fetch_strategy(FetchStrategy::FromServer);
        let outcome = self.execute_query(&query).await?;
        Ok(FetchByKeyResult {
            entity: outcome.entities().first().copied(),
            from_cache: false,
        })
    }

    /// Query for whatever `id` reaches through `nav`.
    pub fn navigation_query(&self, id: EntityId, nav: &str) -> AppResult<EntityQuery> {
        let et = self.entity_type_of(id)?;
        EntityQuery::from_entity_navigation(&self.metadata, &et.short_name, nav, &self.view(id))
    }

    /// Fetch a navigation from the server, link the results and mark it loaded.
    #[instrument(skip(self), fields(manager = %self.id))]
    pub async fn load_navigation_property(&mut self, id: EntityId, nav: &str) -> AppResult<QueryOutcome> {
        let query = self
            .navigation_query(id, nav)?
            .using_fetch_strategy(FetchStrategy::FromServer);
        let outcome = self.execute_query(&query).await?;
        self.link_loaded_navigation(id, nav, &outcome.entities())?;
        Ok(outcome)
    }

    pub(crate) fn link_loaded_navigation(
        &mut self,
        id: EntityId,
        nav: &str,
        related: &[EntityId],
    ) -> AppResult<()> {
        let et = self.entity_type_of(id)?;
        let np = et
            .navigation_property(nav)
            .cloned()
            .ok_or_else(|| AppError::unknown_property(&et.short_name, nav))?;
        let ctx = WriteContext::loading();
        if np.is_scalar {
            if let Some(first) = related.first() {
                self.write_scalar_navigation(id, nav, Some(*first), ctx)?;
            }
        } else {
            self.add_to_collection(id, nav, related.to_vec(), None, ctx)?;
        }
        self.record_mut(id)?.aspect.mark_loaded(nav);
        Ok(())
    }
}
