//! `/api/v0` endpoint handlers
//!
//! Per-item errors in batch endpoints (info, changes, depsolve, freeze,
//! delete) are reported alongside the successful items; the overall request
//! still succeeds. Whole-request failures (bad identifiers, unknown uuids,
//! disabled types) use the error body from [`super::ApiError`].

use std::collections::BTreeMap;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::blueprint::{Blueprint, DiffEntry};
use crate::compose;
use crate::queue::{BuildStatus, ComposeInfo, ComposeStatus};
use crate::resolver::{PackageNEVRA, ProjectInfo, Source};
use crate::store::{ChangeEntry, DEFAULT_BRANCH};

use super::{blocking, check_chars, ApiError, AppState, ErrorEntry};

const DEFAULT_LIMIT: usize = 20;

fn branch_or_default(branch: &Option<String>) -> Result<String, ApiError> {
    match branch {
        Some(branch) => {
            check_chars(branch, "branch argument")?;
            Ok(branch.clone())
        }
        None => Ok(DEFAULT_BRANCH.to_string()),
    }
}

fn split_names(names: &str, what: &str) -> Result<Vec<String>, ApiError> {
    check_chars(names, what)?;
    Ok(names
        .split(',')
        .filter(|n| !n.is_empty())
        .map(|n| n.to_string())
        .collect())
}

/// Parse a posted blueprint as TOML or JSON depending on Content-Type.
fn parse_blueprint(headers: &HeaderMap, body: &str) -> Result<Blueprint, ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json");
    let blueprint = if content_type.contains("toml") {
        Blueprint::from_toml(body)?
    } else {
        Blueprint::from_json(body)?
    };
    check_chars(&blueprint.name, "blueprint name")?;
    Ok(blueprint)
}

// ---------------------------------------------------------------------------
// status

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub api: String,
    pub backend: String,
    pub build: String,
    pub schema_version: String,
    pub db_supported: bool,
    pub db_version: String,
    pub msgs: Vec<String>,
}

/// `GET /api/v0/status`
pub async fn status() -> Json<StatusResponse> {
    Json(StatusResponse {
        api: "0".to_string(),
        backend: "imageforge".to_string(),
        build: env!("CARGO_PKG_VERSION").to_string(),
        schema_version: "0".to_string(),
        db_supported: true,
        db_version: "0".to_string(),
        msgs: Vec::new(),
    })
}

// ---------------------------------------------------------------------------
// blueprints

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub branch: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BlueprintsListResponse {
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
    pub blueprints: Vec<String>,
}

/// `GET /api/v0/blueprints/list`
pub async fn blueprints_list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<BlueprintsListResponse>, ApiError> {
    let branch = branch_or_default(&query.branch)?;
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    let offset = query.offset.unwrap_or(0);
    let (total, blueprints) =
        blocking(move || Ok(state.store().list(&branch, limit, offset)?)).await?;
    Ok(Json(BlueprintsListResponse {
        total,
        offset,
        limit,
        blueprints,
    }))
}

#[derive(Debug, Deserialize)]
pub struct InfoQuery {
    pub branch: Option<String>,
    pub format: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChangedFlag {
    pub name: String,
    pub changed: bool,
}

#[derive(Debug, Serialize)]
pub struct BlueprintsInfoResponse {
    pub blueprints: Vec<Blueprint>,
    pub changes: Vec<ChangedFlag>,
    pub errors: Vec<ErrorEntry>,
}

/// `GET /api/v0/blueprints/info/<names>`
pub async fn blueprints_info(
    State(state): State<AppState>,
    Path(names): Path<String>,
    Query(query): Query<InfoQuery>,
) -> Result<Response, ApiError> {
    let branch = branch_or_default(&query.branch)?;
    let names = split_names(&names, "blueprint names")?;
    if let Some(format) = &query.format {
        check_chars(format, "format argument")?;
        if format != "json" && format != "toml" {
            return Err(ApiError::bad_request(
                "InvalidChars",
                format!("Invalid format, must be json or toml: {format}"),
            ));
        }
    }
    let want_toml = query.format.as_deref() == Some("toml");

    let (blueprints, changes, errors) = blocking(move || {
        let store = state.store();
        let mut blueprints = Vec::new();
        let mut changes = Vec::new();
        let mut errors = Vec::new();
        for name in names {
            match store.info(&branch, &name) {
                Ok(info) => {
                    changes.push(ChangedFlag {
                        name: info.blueprint.name.clone(),
                        changed: info.changed,
                    });
                    blueprints.push(info.blueprint);
                }
                Err(e) => errors.push(ApiError::from(e).entry()),
            }
        }
        Ok((blueprints, changes, errors))
    })
    .await?;

    if want_toml {
        let mut text = String::new();
        for bp in &blueprints {
            text.push_str(&bp.to_toml_string()?);
            text.push('\n');
        }
        Ok(([(header::CONTENT_TYPE, "text/x-toml")], text).into_response())
    } else {
        Ok(Json(BlueprintsInfoResponse {
            blueprints,
            changes,
            errors,
        })
        .into_response())
    }
}

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub status: bool,
}

/// `POST /api/v0/blueprints/new`
pub async fn blueprints_new(
    State(state): State<AppState>,
    Query(query): Query<InfoQuery>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<OkResponse>, ApiError> {
    let branch = branch_or_default(&query.branch)?;
    let blueprint = parse_blueprint(&headers, &body)?;
    blocking(move || {
        state.store().new_blueprint(&branch, &blueprint)?;
        Ok(())
    })
    .await?;
    Ok(Json(OkResponse { status: true }))
}

/// `POST /api/v0/blueprints/workspace`
pub async fn blueprints_workspace(
    State(state): State<AppState>,
    Query(query): Query<InfoQuery>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<OkResponse>, ApiError> {
    let branch = branch_or_default(&query.branch)?;
    let blueprint = parse_blueprint(&headers, &body)?;
    blocking(move || {
        state.store().workspace().write(&branch, &blueprint)?;
        Ok(())
    })
    .await?;
    Ok(Json(OkResponse { status: true }))
}

/// `DELETE /api/v0/blueprints/workspace/<name>`
pub async fn blueprints_workspace_delete(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<InfoQuery>,
) -> Result<Json<OkResponse>, ApiError> {
    let branch = branch_or_default(&query.branch)?;
    check_chars(&name, "blueprint name")?;
    blocking(move || {
        state.store().workspace().delete(&branch, &name)?;
        Ok(())
    })
    .await?;
    Ok(Json(OkResponse { status: true }))
}

/// `DELETE /api/v0/blueprints/delete/<name>`
pub async fn blueprints_delete(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<InfoQuery>,
) -> Result<Json<OkResponse>, ApiError> {
    let branch = branch_or_default(&query.branch)?;
    check_chars(&name, "blueprint name")?;
    blocking(move || {
        state.store().delete(&branch, &name)?;
        Ok(())
    })
    .await?;
    Ok(Json(OkResponse { status: true }))
}

#[derive(Debug, Serialize)]
pub struct BlueprintChanges {
    pub name: String,
    pub changes: Vec<ChangeEntry>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct BlueprintsChangesResponse {
    pub blueprints: Vec<BlueprintChanges>,
    pub errors: Vec<ErrorEntry>,
    pub limit: usize,
    pub offset: usize,
}

/// `GET /api/v0/blueprints/changes/<names>`
pub async fn blueprints_changes(
    State(state): State<AppState>,
    Path(names): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<BlueprintsChangesResponse>, ApiError> {
    let branch = branch_or_default(&query.branch)?;
    let names = split_names(&names, "blueprint names")?;
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    let offset = query.offset.unwrap_or(0);

    let (blueprints, errors) = blocking(move || {
        let store = state.store();
        let mut blueprints = Vec::new();
        let mut errors = Vec::new();
        for name in names {
            match store.changes(&branch, &name, limit, offset) {
                Ok((total, changes)) => blueprints.push(BlueprintChanges {
                    name,
                    changes,
                    total,
                }),
                Err(e) => errors.push(ApiError::from(e).entry()),
            }
        }
        Ok((blueprints, errors))
    })
    .await?;

    Ok(Json(BlueprintsChangesResponse {
        blueprints,
        errors,
        limit,
        offset,
    }))
}

/// `POST /api/v0/blueprints/undo/<name>/<commit>`
pub async fn blueprints_undo(
    State(state): State<AppState>,
    Path((name, commit)): Path<(String, String)>,
    Query(query): Query<InfoQuery>,
) -> Result<Json<OkResponse>, ApiError> {
    let branch = branch_or_default(&query.branch)?;
    check_chars(&name, "blueprint name")?;
    check_chars(&commit, "commit argument")?;
    blocking(move || {
        state.store().undo(&branch, &name, &commit)?;
        Ok(())
    })
    .await?;
    Ok(Json(OkResponse { status: true }))
}

/// `POST /api/v0/blueprints/tag/<name>`
pub async fn blueprints_tag(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<InfoQuery>,
) -> Result<Json<OkResponse>, ApiError> {
    let branch = branch_or_default(&query.branch)?;
    check_chars(&name, "blueprint name")?;
    blocking(move || {
        state.store().tag(&branch, &name)?;
        Ok(())
    })
    .await?;
    Ok(Json(OkResponse { status: true }))
}

#[derive(Debug, Serialize)]
pub struct DiffResponse {
    pub diff: Vec<DiffEntry>,
}

/// `GET /api/v0/blueprints/diff/<name>/<from>/<to>`
pub async fn blueprints_diff(
    State(state): State<AppState>,
    Path((name, from, to)): Path<(String, String, String)>,
    Query(query): Query<InfoQuery>,
) -> Result<Json<DiffResponse>, ApiError> {
    let branch = branch_or_default(&query.branch)?;
    check_chars(&name, "blueprint name")?;
    check_chars(&from, "from commit")?;
    check_chars(&to, "to commit")?;
    let diff = blocking(move || Ok(state.store().diff(&branch, &name, &from, &to)?)).await?;
    Ok(Json(DiffResponse { diff }))
}

#[derive(Debug, Serialize)]
pub struct BlueprintDeps {
    pub blueprint: Blueprint,
    pub dependencies: Vec<PackageNEVRA>,
}

#[derive(Debug, Serialize)]
pub struct DepsolveResponse {
    pub blueprints: Vec<BlueprintDeps>,
    pub errors: Vec<ErrorEntry>,
}

/// Depsolve the effective (workspace overlay or committed head) blueprint.
fn depsolve_blueprint(
    state: &AppState,
    branch: &str,
    name: &str,
) -> Result<(Blueprint, Vec<PackageNEVRA>), ApiError> {
    let blueprint = {
        let store = state.store();
        store.info(branch, name)?.blueprint
    };
    let mut projects = blueprint.module_nver();
    projects.extend(blueprint.package_nver());
    projects.sort_by(|a, b| a.0.to_lowercase().cmp(&b.0.to_lowercase()));
    projects.dedup();
    let (_, deps) = {
        let mut resolver = state.resolver();
        resolver
            .depsolve(&projects, &blueprint.group_names(), false)
            .map_err(|e| ApiError::bad_request("BlueprintsError", e.to_string()))?
    };
    Ok((blueprint, deps))
}

/// `GET /api/v0/blueprints/depsolve/<names>`
pub async fn blueprints_depsolve(
    State(state): State<AppState>,
    Path(names): Path<String>,
    Query(query): Query<InfoQuery>,
) -> Result<Json<DepsolveResponse>, ApiError> {
    let branch = branch_or_default(&query.branch)?;
    let names = split_names(&names, "blueprint names")?;

    let (blueprints, errors) = blocking(move || {
        let mut blueprints = Vec::new();
        let mut errors = Vec::new();
        for name in names {
            match depsolve_blueprint(&state, &branch, &name) {
                Ok((blueprint, dependencies)) => blueprints.push(BlueprintDeps {
                    blueprint,
                    dependencies,
                }),
                Err(e) => errors.push(e.entry()),
            }
        }
        Ok((blueprints, errors))
    })
    .await?;

    Ok(Json(DepsolveResponse { blueprints, errors }))
}

#[derive(Debug, Serialize)]
pub struct FrozenEntry {
    pub blueprint: Blueprint,
}

#[derive(Debug, Serialize)]
pub struct FreezeResponse {
    pub blueprints: Vec<FrozenEntry>,
    pub errors: Vec<ErrorEntry>,
}

/// `GET /api/v0/blueprints/freeze/<names>`
pub async fn blueprints_freeze(
    State(state): State<AppState>,
    Path(names): Path<String>,
    Query(query): Query<InfoQuery>,
) -> Result<Response, ApiError> {
    let branch = branch_or_default(&query.branch)?;
    let names = split_names(&names, "blueprint names")?;
    if let Some(format) = &query.format {
        check_chars(format, "format argument")?;
    }
    let want_toml = query.format.as_deref() == Some("toml");

    let (blueprints, errors) = blocking(move || {
        let mut blueprints = Vec::new();
        let mut errors = Vec::new();
        for name in names {
            match depsolve_blueprint(&state, &branch, &name) {
                Ok((blueprint, deps)) => blueprints.push(FrozenEntry {
                    blueprint: blueprint.freeze(&deps),
                }),
                Err(e) => errors.push(e.entry()),
            }
        }
        Ok((blueprints, errors))
    })
    .await?;

    if want_toml {
        let mut text = String::new();
        for entry in &blueprints {
            text.push_str(&entry.blueprint.to_toml_string()?);
            text.push('\n');
        }
        Ok(([(header::CONTENT_TYPE, "text/x-toml")], text).into_response())
    } else {
        Ok(Json(FreezeResponse { blueprints, errors }).into_response())
    }
}

// ---------------------------------------------------------------------------
// projects & modules

#[derive(Debug, Deserialize)]
pub struct ProjectsQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub pattern: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ProjectsListResponse {
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
    pub projects: Vec<ProjectInfo>,
}

/// `GET /api/v0/projects/list`
pub async fn projects_list(
    State(state): State<AppState>,
    Query(query): Query<ProjectsQuery>,
) -> Result<Json<ProjectsListResponse>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    let offset = query.offset.unwrap_or(0);
    if let Some(pattern) = &query.pattern {
        check_chars(pattern, "pattern argument")?;
    }
    let (total, projects) = blocking(move || {
        let mut resolver = state.resolver();
        Ok(resolver.list_projects(query.pattern.as_deref(), limit, offset)?)
    })
    .await?;
    Ok(Json(ProjectsListResponse {
        total,
        offset,
        limit,
        projects,
    }))
}

#[derive(Debug, Serialize)]
pub struct ProjectsInfoResponse {
    pub projects: Vec<ProjectInfo>,
}

/// `GET /api/v0/projects/info/<names>`
pub async fn projects_info(
    State(state): State<AppState>,
    Path(names): Path<String>,
) -> Result<Json<ProjectsInfoResponse>, ApiError> {
    let names = split_names(&names, "project names")?;
    let projects = blocking(move || {
        let mut resolver = state.resolver();
        Ok(resolver.project_info(&names)?)
    })
    .await?;
    Ok(Json(ProjectsInfoResponse { projects }))
}

#[derive(Debug, Serialize)]
pub struct ProjectsDepsolveResponse {
    pub projects: Vec<PackageNEVRA>,
}

/// `GET /api/v0/projects/depsolve/<names>`
pub async fn projects_depsolve(
    State(state): State<AppState>,
    Path(names): Path<String>,
) -> Result<Json<ProjectsDepsolveResponse>, ApiError> {
    let names = split_names(&names, "project names")?;
    let projects = blocking(move || {
        let requests: Vec<(String, String)> =
            names.into_iter().map(|n| (n, "*".to_string())).collect();
        let mut resolver = state.resolver();
        let (_, deps) = resolver.depsolve(&requests, &[], false)?;
        Ok(deps)
    })
    .await?;
    Ok(Json(ProjectsDepsolveResponse { projects }))
}

#[derive(Debug, Serialize)]
pub struct SourcesListResponse {
    pub sources: Vec<String>,
}

/// `GET /api/v0/projects/source/list`
pub async fn sources_list(
    State(state): State<AppState>,
) -> Result<Json<SourcesListResponse>, ApiError> {
    let sources = blocking(move || Ok(state.resolver().sources_list()?)).await?;
    Ok(Json(SourcesListResponse { sources }))
}

#[derive(Debug, Serialize)]
pub struct SourcesInfoResponse {
    pub sources: BTreeMap<String, Source>,
    pub errors: Vec<ErrorEntry>,
}

/// `GET /api/v0/projects/source/info/<ids>`
pub async fn sources_info(
    State(state): State<AppState>,
    Path(ids): Path<String>,
) -> Result<Json<SourcesInfoResponse>, ApiError> {
    let ids = split_names(&ids, "source ids")?;
    let (sources, errors) = blocking(move || {
        let mut resolver = state.resolver();
        let mut sources = BTreeMap::new();
        let mut errors = Vec::new();
        for id in ids {
            match resolver.sources_info(&[id.clone()]) {
                Ok(mut found) if !found.is_empty() => {
                    sources.insert(id, found.remove(0));
                }
                Ok(_) => errors.push(ErrorEntry {
                    id: "UnknownSource".to_string(),
                    msg: format!("{id} is not a valid source"),
                }),
                Err(e) => errors.push(ApiError::from(e).entry()),
            }
        }
        Ok((sources, errors))
    })
    .await?;
    Ok(Json(SourcesInfoResponse { sources, errors }))
}

/// `POST /api/v0/projects/source/new`
pub async fn sources_new(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<OkResponse>, ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json");
    let source: Source = if content_type.contains("toml") {
        toml::from_str(&body)
            .map_err(|e| ApiError::bad_request("ProjectsError", format!("Problem parsing POST body: {e}")))?
    } else {
        serde_json::from_str(&body)
            .map_err(|e| ApiError::bad_request("ProjectsError", format!("Problem parsing POST body: {e}")))?
    };
    check_chars(&source.name, "source name")?;
    blocking(move || {
        state.resolver().source_add(source)?;
        Ok(())
    })
    .await?;
    Ok(Json(OkResponse { status: true }))
}

/// `DELETE /api/v0/projects/source/delete/<id>`
pub async fn sources_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OkResponse>, ApiError> {
    check_chars(&id, "source id")?;
    blocking(move || {
        state.resolver().source_delete(&id)?;
        Ok(())
    })
    .await?;
    Ok(Json(OkResponse { status: true }))
}

#[derive(Debug, Serialize)]
pub struct ModuleEntry {
    pub name: String,
    pub group_type: String,
}

#[derive(Debug, Serialize)]
pub struct ModulesListResponse {
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
    pub modules: Vec<ModuleEntry>,
}

fn module_entries(projects: Vec<ProjectInfo>) -> Vec<ModuleEntry> {
    projects
        .into_iter()
        .map(|p| ModuleEntry {
            name: p.name,
            group_type: "rpm".to_string(),
        })
        .collect()
}

/// `GET /api/v0/modules/list`
pub async fn modules_list(
    State(state): State<AppState>,
    Query(query): Query<ProjectsQuery>,
) -> Result<Json<ModulesListResponse>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    let offset = query.offset.unwrap_or(0);
    let (total, projects) = blocking(move || {
        let mut resolver = state.resolver();
        Ok(resolver.list_projects(query.pattern.as_deref(), limit, offset)?)
    })
    .await?;
    Ok(Json(ModulesListResponse {
        total,
        offset,
        limit,
        modules: module_entries(projects),
    }))
}

/// `GET /api/v0/modules/list/<names>`
pub async fn modules_list_names(
    State(state): State<AppState>,
    Path(names): Path<String>,
    Query(query): Query<ProjectsQuery>,
) -> Result<Json<ModulesListResponse>, ApiError> {
    let names = split_names(&names, "module names")?;
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    let offset = query.offset.unwrap_or(0);
    let projects = blocking(move || {
        let mut resolver = state.resolver();
        Ok(resolver.project_info(&names)?)
    })
    .await?;
    let total = projects.len();
    let modules: Vec<ModuleEntry> = module_entries(projects)
        .into_iter()
        .skip(offset)
        .take(limit)
        .collect();
    Ok(Json(ModulesListResponse {
        total,
        offset,
        limit,
        modules,
    }))
}

#[derive(Debug, Serialize)]
pub struct ModulesInfoResponse {
    pub modules: Vec<ProjectInfo>,
}

/// `GET /api/v0/modules/info/<names>`
pub async fn modules_info(
    State(state): State<AppState>,
    Path(names): Path<String>,
) -> Result<Json<ModulesInfoResponse>, ApiError> {
    let names = split_names(&names, "module names")?;
    let modules = blocking(move || {
        let mut resolver = state.resolver();
        Ok(resolver.project_info(&names)?)
    })
    .await?;
    Ok(Json(ModulesInfoResponse { modules }))
}

// ---------------------------------------------------------------------------
// compose

#[derive(Debug, Serialize)]
pub struct TypeEntry {
    pub name: String,
    pub enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct ComposeTypesResponse {
    pub types: Vec<TypeEntry>,
}

/// `GET /api/v0/compose/types`
pub async fn compose_types(
    State(state): State<AppState>,
) -> Result<Json<ComposeTypesResponse>, ApiError> {
    let types = blocking(move || {
        let arch = state
            .cfg
            .resolver
            .arch
            .clone()
            .unwrap_or_else(compose::build_arch);
        Ok(compose::compose_types(&state.cfg.paths.share_dir, &arch))
    })
    .await?;
    Ok(Json(ComposeTypesResponse {
        types: types
            .into_iter()
            .map(|(name, enabled)| TypeEntry { name, enabled })
            .collect(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ComposeRequest {
    pub blueprint_name: String,
    pub compose_type: String,
    pub branch: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ComposeStartQuery {
    pub test: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct ComposeStartResponse {
    pub status: bool,
    pub build_id: String,
}

/// `POST /api/v0/compose[?test=1|2]`
pub async fn compose_start(
    State(state): State<AppState>,
    Query(query): Query<ComposeStartQuery>,
    Json(request): Json<ComposeRequest>,
) -> Result<Json<ComposeStartResponse>, ApiError> {
    let branch = branch_or_default(&request.branch)?;
    check_chars(&request.blueprint_name, "blueprint name")?;
    check_chars(&request.compose_type, "compose type")?;
    let test_mode = query.test.unwrap_or(0);

    let build_id = blocking(move || {
        Ok(compose::start_build(
            &state.cfg,
            &state.store,
            &state.resolver,
            &branch,
            &request.blueprint_name,
            &request.compose_type,
            test_mode,
        )?)
    })
    .await?;
    info!(build = %build_id, "compose request accepted");

    Ok(Json(ComposeStartResponse {
        status: true,
        build_id: build_id.to_string(),
    }))
}

#[derive(Debug, Serialize)]
pub struct ComposeQueueResponse {
    pub new: Vec<ComposeStatus>,
    pub run: Vec<ComposeStatus>,
}

/// `GET /api/v0/compose/queue`
pub async fn compose_queue(
    State(state): State<AppState>,
) -> Result<Json<ComposeQueueResponse>, ApiError> {
    let (new, run) = blocking(move || {
        let new = state
            .queue
            .waiting()
            .iter()
            .filter_map(|uuid| state.queue.status(uuid).ok())
            .collect();
        let run = state
            .queue
            .running()
            .iter()
            .filter_map(|uuid| state.queue.status(uuid).ok())
            .collect();
        Ok((new, run))
    })
    .await?;
    Ok(Json(ComposeQueueResponse { new, run }))
}

#[derive(Debug, Serialize)]
pub struct ComposeFinishedResponse {
    pub finished: Vec<ComposeStatus>,
}

/// `GET /api/v0/compose/finished`
pub async fn compose_finished(
    State(state): State<AppState>,
) -> Result<Json<ComposeFinishedResponse>, ApiError> {
    let finished =
        blocking(move || Ok(state.queue.builds_with_status(|s| s == BuildStatus::Finished)))
            .await?;
    Ok(Json(ComposeFinishedResponse { finished }))
}

#[derive(Debug, Serialize)]
pub struct ComposeFailedResponse {
    pub failed: Vec<ComposeStatus>,
}

/// `GET /api/v0/compose/failed`
pub async fn compose_failed(
    State(state): State<AppState>,
) -> Result<Json<ComposeFailedResponse>, ApiError> {
    let failed =
        blocking(move || Ok(state.queue.builds_with_status(|s| s == BuildStatus::Failed))).await?;
    Ok(Json(ComposeFailedResponse { failed }))
}

#[derive(Debug, Deserialize)]
pub struct StatusFilter {
    pub blueprint: Option<String>,
    #[serde(rename = "type")]
    pub compose_type: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ComposeStatusResponse {
    pub uuids: Vec<ComposeStatus>,
}

/// `GET /api/v0/compose/status/<uuids-or-*>`
pub async fn compose_status(
    State(state): State<AppState>,
    Path(uuids): Path<String>,
    Query(filter): Query<StatusFilter>,
) -> Result<Json<ComposeStatusResponse>, ApiError> {
    check_chars(&uuids, "uuids")?;
    for value in [&filter.blueprint, &filter.compose_type, &filter.status]
        .into_iter()
        .flatten()
    {
        check_chars(value, "filter argument")?;
    }

    let uuids = blocking(move || {
        let mut statuses: Vec<ComposeStatus> = if uuids == "*" {
            state.queue.builds_with_status(|_| true)
        } else {
            uuids
                .split(',')
                .filter(|u| !u.is_empty())
                .filter_map(|uuid| state.queue.status(uuid).ok())
                .collect()
        };
        if let Some(blueprint) = &filter.blueprint {
            statuses.retain(|s| &s.blueprint == blueprint);
        }
        if let Some(compose_type) = &filter.compose_type {
            statuses.retain(|s| &s.compose_type == compose_type);
        }
        if let Some(status) = &filter.status {
            statuses.retain(|s| s.queue_status.to_string() == *status);
        }
        Ok(statuses)
    })
    .await?;
    Ok(Json(ComposeStatusResponse { uuids }))
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub status: bool,
    pub uuid: String,
}

/// `DELETE /api/v0/compose/cancel/<uuid>`
pub async fn compose_cancel(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    check_chars(&uuid, "uuid")?;
    let canceled_uuid = uuid.clone();
    blocking(move || {
        state.queue.cancel(&uuid)?;
        Ok(())
    })
    .await?;
    Ok(Json(CancelResponse {
        status: true,
        uuid: canceled_uuid,
    }))
}

#[derive(Debug, Serialize)]
pub struct DeleteEntry {
    pub uuid: String,
    pub status: bool,
}

#[derive(Debug, Serialize)]
pub struct ComposeDeleteResponse {
    pub uuids: Vec<DeleteEntry>,
    pub errors: Vec<ErrorEntry>,
}

/// `DELETE /api/v0/compose/delete/<uuids>`
pub async fn compose_delete(
    State(state): State<AppState>,
    Path(uuids): Path<String>,
) -> Result<Json<ComposeDeleteResponse>, ApiError> {
    let uuids = split_names(&uuids, "uuids")?;
    let (deleted, errors) = blocking(move || {
        let mut deleted = Vec::new();
        let mut errors = Vec::new();
        for uuid in uuids {
            match state.queue.delete(&uuid) {
                Ok(()) => deleted.push(DeleteEntry { uuid, status: true }),
                Err(e) => errors.push(ApiError::from(e).entry()),
            }
        }
        Ok((deleted, errors))
    })
    .await?;
    Ok(Json(ComposeDeleteResponse {
        uuids: deleted,
        errors,
    }))
}

/// `GET /api/v0/compose/info/<uuid>`
pub async fn compose_info(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<Json<ComposeInfo>, ApiError> {
    check_chars(&uuid, "uuid")?;
    let info = blocking(move || Ok(state.queue.info(&uuid)?)).await?;
    Ok(Json(info))
}

/// Build a tar archive in memory and return it as a download.
fn tar_download(
    filename: String,
    build: impl FnOnce(&mut tar::Builder<Vec<u8>>) -> std::io::Result<()>,
) -> Result<Response, ApiError> {
    let mut builder = tar::Builder::new(Vec::new());
    build(&mut builder).map_err(|e| ApiError::internal(format!("building archive: {e}")))?;
    let bytes = builder
        .into_inner()
        .map_err(|e| ApiError::internal(format!("finishing archive: {e}")))?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/x-tar".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={filename}"),
            ),
        ],
        Body::from(bytes),
    )
        .into_response())
}

/// The metadata file names inside a result directory.
const METADATA_FILES: [&str; 4] = ["COMMIT", "blueprint.toml", "frozen.toml", "deps.toml"];

/// `GET /api/v0/compose/metadata/<uuid>`
pub async fn compose_metadata(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<Response, ApiError> {
    check_chars(&uuid, "uuid")?;
    // Existence check doubles as uuid validation.
    let results = blocking({
        let state = state.clone();
        let uuid = uuid.clone();
        move || {
            state.queue.status(&uuid)?;
            Ok(state.queue.results_dir(&uuid))
        }
    })
    .await?;

    tar_download(format!("{uuid}-metadata.tar"), move |builder| {
        for name in METADATA_FILES {
            let path = results.join(name);
            if path.exists() {
                builder.append_path_with_name(&path, format!("{uuid}/{name}"))?;
            }
        }
        Ok(())
    })
}

/// `GET /api/v0/compose/results/<uuid>`
pub async fn compose_results(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<Response, ApiError> {
    check_chars(&uuid, "uuid")?;
    let results = blocking({
        let state = state.clone();
        let uuid = uuid.clone();
        move || {
            state.queue.status(&uuid)?;
            Ok(state.queue.results_dir(&uuid))
        }
    })
    .await?;
    tar_download(format!("{uuid}.tar"), move |builder| {
        builder.append_dir_all(&uuid, &results)
    })
}

/// `GET /api/v0/compose/logs/<uuid>`
pub async fn compose_logs(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<Response, ApiError> {
    check_chars(&uuid, "uuid")?;
    let logs = blocking({
        let state = state.clone();
        let uuid = uuid.clone();
        move || {
            state.queue.status(&uuid)?;
            Ok(state.queue.results_dir(&uuid).join("logs"))
        }
    })
    .await?;
    if !logs.is_dir() {
        return Err(ApiError::bad_request(
            "BuildInQueueError",
            format!("Build {uuid} has no logs"),
        ));
    }
    tar_download(format!("{uuid}-logs.tar"), move |builder| {
        builder.append_dir_all("logs", &logs)
    })
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    /// Tail size in kibibytes.
    pub size: Option<u64>,
}

/// `GET /api/v0/compose/log/<uuid>[?size=KiB]`
pub async fn compose_log(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    Query(query): Query<LogQuery>,
) -> Result<Response, ApiError> {
    check_chars(&uuid, "uuid")?;
    let size = query.size.unwrap_or(1024) * 1024;
    let tail = blocking(move || {
        let status = state.queue.status(&uuid)?;
        if status.queue_status == BuildStatus::Waiting {
            return Err(ApiError::bad_request(
                "BuildInQueueError",
                format!("Build {uuid} has not started yet. No logs to view"),
            ));
        }
        let path = state.queue.results_dir(&uuid).join("logs/program.log");
        let text = std::fs::read_to_string(&path).unwrap_or_default();
        let mut start = text.len().saturating_sub(size as usize);
        while !text.is_char_boundary(start) {
            start += 1;
        }
        Ok(text[start..].to_string())
    })
    .await?;
    Ok(([(header::CONTENT_TYPE, "text/plain")], tail).into_response())
}

/// `GET /api/v0/compose/image/<uuid>`
pub async fn compose_image(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<Response, ApiError> {
    check_chars(&uuid, "uuid")?;
    let uuid_for_filename = uuid.clone();
    let (image_name, bytes) = blocking(move || {
        let info = state.queue.info(&uuid)?;
        let path = state
            .queue
            .results_dir(&uuid)
            .join(&info.config.compose.image_name);
        if !path.exists() {
            return Err(ApiError::bad_request(
                "BuildMissingFile",
                format!("Build {uuid} is missing image file {}", info.config.compose.image_name),
            ));
        }
        let bytes = std::fs::read(&path).map_err(|e| ApiError::internal(e.to_string()))?;
        Ok((info.config.compose.image_name, bytes))
    })
    .await?;
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={uuid_for_filename}-{image_name}"),
            ),
        ],
        Body::from(bytes),
    )
        .into_response())
}
