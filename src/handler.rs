// src/handler.rs - Activity handlers and the route registry
use crate::error::{ProcessingError, Result};
use crate::path::EntityPath;
use crate::value::Value;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Occurrence as handed to the activity handler of its route.
///
/// Arguments are already validated, completed with defaults and
/// decalibrated to raw values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityInvocation {
    pub occurrence_id: u64,
    pub activity_id: i32,
    pub path: EntityPath,
    pub activity_type: String,
    pub route: String,
    pub source: String,
    pub arguments: BTreeMap<String, Value>,
    pub properties: BTreeMap<String, String>,
    pub generation_time: DateTime<Utc>,
}

/// Component forwarding activity occurrences to the controlled system.
///
/// Handlers report back through `ProcessingModel::try_report_activity_progress`
/// (or the awaiting `report_activity_progress` from async code).
/// `execute_activity` runs on a processing worker and must not wait for the
/// model.
#[cfg_attr(test, mockall::automock)]
pub trait ActivityHandler: Send + Sync {
    fn name(&self) -> String;

    fn supported_routes(&self) -> Vec<String>;

    fn supported_activity_types(&self) -> Vec<String>;

    fn is_route_available(&self, _route: &str) -> bool {
        true
    }

    fn execute_activity(&self, invocation: &ActivityInvocation) -> Result<()>;

    fn abort_activity(&self, activity_id: i32, occurrence_id: u64) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteAvailability {
    pub route: String,
    pub activity_type: String,
    pub handler: String,
    pub available: bool,
}

/// Registry of handlers by `(route, activity type)`
#[derive(Default)]
pub struct HandlerRegistry {
    routes: RwLock<HashMap<(String, String), Arc<dyn ActivityHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every route/type pair of `handler`; nothing is registered
    /// if one pair is already taken
    pub fn register(&self, handler: Arc<dyn ActivityHandler>) -> Result<()> {
        let name = handler.name();
        let pairs: Vec<(String, String)> = handler
            .supported_routes()
            .into_iter()
            .flat_map(|route| {
                handler
                    .supported_activity_types()
                    .into_iter()
                    .map(move |ty| (route.clone(), ty))
            })
            .collect();

        let mut routes = self.routes.write();
        if let Some((route, ty)) = pairs.iter().find(|pair| routes.contains_key(*pair)) {
            return Err(ProcessingError::Activity(format!(
                "Route {} for activity type {} is already handled, cannot register handler {}",
                route, ty, name
            )));
        }
        for pair in pairs {
            debug!("Handler {} registered for route {} type {}", name, pair.0, pair.1);
            routes.insert(pair, handler.clone());
        }
        info!("Activity handler {} registered", name);
        Ok(())
    }

    pub fn deregister(&self, name: &str) -> Result<()> {
        let mut routes = self.routes.write();
        let before = routes.len();
        routes.retain(|_, h| h.name() != name);
        if routes.len() == before {
            return Err(ProcessingError::Activity(format!(
                "Activity handler {} is not registered",
                name
            )));
        }
        info!("Activity handler {} deregistered", name);
        Ok(())
    }

    pub fn lookup(&self, route: &str, activity_type: &str) -> Option<Arc<dyn ActivityHandler>> {
        self.routes
            .read()
            .get(&(route.to_string(), activity_type.to_string()))
            .cloned()
    }

    /// Handler for the pair, failing if none is registered or the route is
    /// currently unavailable
    pub fn available_handler(&self, route: &str, activity_type: &str) -> Result<Arc<dyn ActivityHandler>> {
        let handler = self.lookup(route, activity_type).ok_or_else(|| {
            ProcessingError::Activity(format!(
                "No handler for route {} and activity type {}",
                route, activity_type
            ))
        })?;
        if !handler.is_route_available(route) {
            return Err(ProcessingError::Activity(format!("Route {} is not available", route)));
        }
        Ok(handler)
    }

    pub fn forward(&self, invocation: &ActivityInvocation) -> Result<()> {
        let handler = self.available_handler(&invocation.route, &invocation.activity_type)?;
        handler.execute_activity(invocation)
    }

    pub fn abort(&self, route: &str, activity_type: &str, activity_id: i32, occurrence_id: u64) -> Result<()> {
        let handler = self.lookup(route, activity_type).ok_or_else(|| {
            ProcessingError::Activity(format!("No handler for route {} to abort {}", route, occurrence_id))
        })?;
        handler.abort_activity(activity_id, occurrence_id).map_err(|e| {
            warn!("Handler {} refused abort of occurrence {}: {}", handler.name(), occurrence_id, e);
            e
        })
    }

    /// Routes able to carry `activity_type`, sorted by route name
    pub fn route_availability(&self, activity_type: &str) -> Vec<RouteAvailability> {
        let mut out: Vec<RouteAvailability> = self
            .routes
            .read()
            .iter()
            .filter(|((_, ty), _)| ty == activity_type)
            .map(|((route, ty), handler)| RouteAvailability {
                route: route.clone(),
                activity_type: ty.clone(),
                handler: handler.name(),
                available: handler.is_route_available(route),
            })
            .collect();
        out.sort_by(|a, b| a.route.cmp(&b.route));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler(name: &str, routes: &[&str]) -> MockActivityHandler {
        let mut mock = MockActivityHandler::new();
        let name = name.to_string();
        let routes: Vec<String> = routes.iter().map(|r| r.to_string()).collect();
        mock.expect_name().returning(move || name.clone());
        mock.expect_supported_routes().returning(move || routes.clone());
        mock.expect_supported_activity_types()
            .returning(|| vec!["TC".to_string()]);
        mock.expect_is_route_available()
            .returning(|route| route != "DOWN");
        mock
    }

    #[test]
    fn test_duplicate_route_rejected() {
        let registry = HandlerRegistry::new();
        registry.register(Arc::new(handler("first", &["R1", "R2"]))).unwrap();
        let err = registry.register(Arc::new(handler("second", &["R3", "R2"])));
        assert!(matches!(err, Err(ProcessingError::Activity(_))));
        // nothing of the rejected handler is registered
        assert!(registry.lookup("R3", "TC").is_none());
    }

    #[test]
    fn test_availability_and_deregistration() {
        let registry = HandlerRegistry::new();
        registry.register(Arc::new(handler("h", &["UP", "DOWN"]))).unwrap();
        let availability = registry.route_availability("TC");
        assert_eq!(availability.len(), 2);
        assert_eq!(availability[0].route, "DOWN");
        assert!(!availability[0].available);
        assert!(availability[1].available);
        assert!(registry.available_handler("DOWN", "TC").is_err());

        registry.deregister("h").unwrap();
        assert!(registry.route_availability("TC").is_empty());
        assert!(registry.deregister("h").is_err());
    }
}
