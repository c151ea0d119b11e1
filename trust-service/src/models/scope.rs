use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

/// Named capability a consumer may be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthConsumerScope {
    User,
    AccessToken,
    Action,
    Admin,
    Group,
    Template,
    Project,
    Run,
    RunExecution,
    Hooks,
    WorkerModel,
    Hatchery,
    Service,
}

impl AuthConsumerScope {
    pub const ALL: [AuthConsumerScope; 13] = [
        AuthConsumerScope::User,
        AuthConsumerScope::AccessToken,
        AuthConsumerScope::Action,
        AuthConsumerScope::Admin,
        AuthConsumerScope::Group,
        AuthConsumerScope::Template,
        AuthConsumerScope::Project,
        AuthConsumerScope::Run,
        AuthConsumerScope::RunExecution,
        AuthConsumerScope::Hooks,
        AuthConsumerScope::WorkerModel,
        AuthConsumerScope::Hatchery,
        AuthConsumerScope::Service,
    ];
}

impl fmt::Display for AuthConsumerScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

const ALLOWED_METHODS: [&str; 4] = ["GET", "POST", "PUT", "DELETE"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScopeError {
    #[error("a delegated consumer needs at least one scope")]
    Empty,

    #[error("duplicated scope {0}")]
    DuplicatedScope(AuthConsumerScope),

    #[error("duplicated route {route} for scope {scope}")]
    DuplicatedRoute {
        scope: AuthConsumerScope,
        route: String,
    },

    #[error("duplicated method {method} on route {route}")]
    DuplicatedMethod { route: String, method: String },

    #[error("invalid method {method} on route {route}")]
    InvalidMethod { route: String, method: String },

    #[error("scope {0} is not granted to the parent consumer")]
    ScopeNotGranted(AuthConsumerScope),

    #[error("scope {0} must keep the parent's endpoint restriction")]
    EndpointsWidened(AuthConsumerScope),

    #[error("route {route} is not granted for scope {scope}")]
    RouteNotGranted {
        scope: AuthConsumerScope,
        route: String,
    },

    #[error("route {route} must keep the parent's method restriction")]
    MethodsWidened { route: String },

    #[error("method {method} is not granted on route {route}")]
    MethodNotGranted { route: String, method: String },
}

/// A route a scope is narrowed to. No methods means every method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeEndpoint {
    pub route: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,
}

impl ScopeEndpoint {
    pub fn new(route: impl Into<String>, methods: &[&str]) -> Self {
        Self {
            route: route.into(),
            methods: methods.iter().map(|m| m.to_string()).collect(),
        }
    }

    fn allows_method(&self, method: &str) -> bool {
        self.methods.is_empty() || self.methods.iter().any(|m| m == method)
    }
}

/// A granted scope. No endpoints means every route of the scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeDetail {
    pub scope: AuthConsumerScope,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<ScopeEndpoint>,
}

impl ScopeDetail {
    pub fn new(scope: AuthConsumerScope) -> Self {
        Self {
            scope,
            endpoints: Vec::new(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: ScopeEndpoint) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    fn endpoint(&self, route: &str) -> Option<&ScopeEndpoint> {
        self.endpoints.iter().find(|e| e.route == route)
    }
}

/// Scope grants of a consumer or session. An empty set is unrestricted and
/// is only ever held by root consumers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeDetails(pub Vec<ScopeDetail>);

impl ScopeDetails {
    pub fn unrestricted() -> Self {
        Self(Vec::new())
    }

    pub fn from_scopes(scopes: &[AuthConsumerScope]) -> Self {
        Self(scopes.iter().copied().map(ScopeDetail::new).collect())
    }

    pub fn is_unrestricted(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, scope: AuthConsumerScope) -> Option<&ScopeDetail> {
        self.0.iter().find(|d| d.scope == scope)
    }

    pub fn scopes(&self) -> Vec<AuthConsumerScope> {
        self.0.iter().map(|d| d.scope).collect()
    }

    /// Rejects duplicated scopes, routes and methods, and methods outside
    /// GET, POST, PUT and DELETE.
    pub fn validate(&self) -> Result<(), ScopeError> {
        let mut scopes = HashSet::new();
        for detail in &self.0 {
            if !scopes.insert(detail.scope) {
                return Err(ScopeError::DuplicatedScope(detail.scope));
            }

            let mut routes = HashSet::new();
            for endpoint in &detail.endpoints {
                if !routes.insert(endpoint.route.as_str()) {
                    return Err(ScopeError::DuplicatedRoute {
                        scope: detail.scope,
                        route: endpoint.route.clone(),
                    });
                }

                let mut methods = HashSet::new();
                for method in &endpoint.methods {
                    if !ALLOWED_METHODS.contains(&method.as_str()) {
                        return Err(ScopeError::InvalidMethod {
                            route: endpoint.route.clone(),
                            method: method.clone(),
                        });
                    }
                    if !methods.insert(method.as_str()) {
                        return Err(ScopeError::DuplicatedMethod {
                            route: endpoint.route.clone(),
                            method: method.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Checks that `self` grants nothing `parent` does not. A level the
    /// parent leaves open accepts anything; a level the parent restricts
    /// must be restricted at least as much.
    pub fn ensure_attenuates(&self, parent: &ScopeDetails) -> Result<(), ScopeError> {
        if parent.is_unrestricted() {
            return Ok(());
        }

        for requested in &self.0 {
            let granted = parent
                .get(requested.scope)
                .ok_or(ScopeError::ScopeNotGranted(requested.scope))?;

            if granted.endpoints.is_empty() {
                continue;
            }
            if requested.endpoints.is_empty() {
                return Err(ScopeError::EndpointsWidened(requested.scope));
            }

            for endpoint in &requested.endpoints {
                let granted_endpoint =
                    granted
                        .endpoint(&endpoint.route)
                        .ok_or_else(|| ScopeError::RouteNotGranted {
                            scope: requested.scope,
                            route: endpoint.route.clone(),
                        })?;

                if granted_endpoint.methods.is_empty() {
                    continue;
                }
                if endpoint.methods.is_empty() {
                    return Err(ScopeError::MethodsWidened {
                        route: endpoint.route.clone(),
                    });
                }
                if let Some(method) = endpoint
                    .methods
                    .iter()
                    .find(|m| !granted_endpoint.allows_method(m))
                {
                    return Err(ScopeError::MethodNotGranted {
                        route: endpoint.route.clone(),
                        method: method.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}
