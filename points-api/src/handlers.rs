use crate::errors::{ApiError, Result};
use crate::models::{
    AccountListQuery, AdjustRequest, BatchAdjustRequest, BatchAdjustResponse, DeleteEntryRequest,
    LogQuery, ToggleAdminRequest, UpdateEntryRequest, UpdateEntryResponse, VerifyRequest,
};
use actix_web::{web, HttpRequest, HttpResponse};
use points_ledger::{AccountId, ErrorKind, Orchestrator, Registration, SortKey, Table};
use serde_json::json;
use std::sync::Arc;

/// Header carrying the authenticated account id, set by the upstream proxy
pub const ACTOR_HEADER: &str = "X-Actor-Account";

type Ledger = web::Data<Arc<Orchestrator>>;

fn actor(req: &HttpRequest) -> Result<AccountId> {
    req.headers()
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| AccountId::parse(v).ok())
        .ok_or(ApiError::MissingActor)
}

/// The account itself or any admin may read an account
async fn require_self_or_admin(ledger: &Orchestrator, actor: &AccountId, id: &AccountId) -> Result<()> {
    if actor == id {
        return Ok(());
    }
    ledger.require_admin(actor).await?;
    Ok(())
}

fn path_account(raw: &str) -> Result<AccountId> {
    AccountId::parse(raw).map_err(|e| ApiError::BadRequest(e.to_string()))
}

/// Health check endpoint
pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "service": "points-api",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Prometheus metrics endpoint
pub async fn metrics_endpoint(ledger: Ledger) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(ledger.metrics().render())
}

/// Register a new account
pub async fn register(ledger: Ledger, form: web::Json<Registration>) -> Result<HttpResponse> {
    let summary = ledger.register(&form).await?;
    Ok(HttpResponse::Created().json(summary))
}

/// Check a password
pub async fn verify(ledger: Ledger, request: web::Json<VerifyRequest>) -> Result<HttpResponse> {
    match ledger.authenticate(&request.account_id, &request.password).await {
        Ok(summary) => Ok(HttpResponse::Ok().json(summary)),
        Err(e) if e.kind() == ErrorKind::Authorization => Err(ApiError::InvalidCredentials),
        Err(e) => Err(e.into()),
    }
}

/// Account summary
pub async fn account_summary(
    ledger: Ledger,
    req: HttpRequest,
    account_id: web::Path<String>,
) -> Result<HttpResponse> {
    let actor = actor(&req)?;
    let id = path_account(&account_id)?;
    require_self_or_admin(&ledger, &actor, &id).await?;

    let summary = ledger.get_account_summary(&id).await?;
    Ok(HttpResponse::Ok().json(summary))
}

/// Account history, newest first
pub async fn account_entries(
    ledger: Ledger,
    req: HttpRequest,
    account_id: web::Path<String>,
) -> Result<HttpResponse> {
    let actor = actor(&req)?;
    let id = path_account(&account_id)?;
    require_self_or_admin(&ledger, &actor, &id).await?;

    let entries = ledger.list_entries(&id).await?;
    Ok(HttpResponse::Ok().json(json!({
        "account_id": id,
        "entries": entries
    })))
}

/// Paged account list with ledger-aggregated balances
pub async fn list_accounts(
    ledger: Ledger,
    req: HttpRequest,
    query: web::Query<AccountListQuery>,
) -> Result<HttpResponse> {
    let actor = actor(&req)?;
    ledger.require_admin(&actor).await?;

    let sort = match query.sort.as_deref() {
        Some(raw) => raw.parse::<SortKey>()?,
        None => SortKey::default(),
    };
    let page = ledger
        .list_accounts_paged(query.search.as_deref(), sort, query.page.unwrap_or(1), query.page_size)
        .await?;

    Ok(HttpResponse::Ok().json(json!({
        "items": page.items,
        "total": page.total,
        "page": page.page,
        "page_size": page.page_size,
        "total_pages": page.total_pages()
    })))
}

/// Adjust one account
pub async fn adjust(
    ledger: Ledger,
    req: HttpRequest,
    request: web::Json<AdjustRequest>,
) -> Result<HttpResponse> {
    let actor = actor(&req)?;
    let entry = ledger
        .adjust_single(
            &actor,
            &request.account_id,
            &request.op,
            &request.amount.as_raw(),
            &request.reason,
        )
        .await?;
    Ok(HttpResponse::Created().json(entry))
}

/// Adjust many accounts; members that cannot be adjusted are skipped
pub async fn batch_adjust(
    ledger: Ledger,
    req: HttpRequest,
    request: web::Json<BatchAdjustRequest>,
) -> Result<HttpResponse> {
    let actor = actor(&req)?;
    let request = request.into_inner();
    let requested = request.accounts.len();

    let committed = ledger
        .adjust_batch(
            &actor,
            &request.accounts,
            &request.op,
            &request.amount.as_raw(),
            &request.reason,
        )
        .await?;

    Ok(HttpResponse::Ok().json(BatchAdjustResponse {
        requested,
        committed,
    }))
}

/// Rewrite an entry
pub async fn update_entry(
    ledger: Ledger,
    req: HttpRequest,
    request: web::Json<UpdateEntryRequest>,
) -> Result<HttpResponse> {
    let actor = actor(&req)?;
    let update = ledger
        .update_entry(
            &actor,
            &request.account_id,
            request.entry_id,
            &request.kind,
            &request.amount.as_raw(),
            &request.reason,
        )
        .await?;

    let changed = !update.is_unchanged();
    Ok(HttpResponse::Ok().json(UpdateEntryResponse {
        previous_amount: update.previous.amount,
        previous_kind: update.previous.kind,
        entry: update.current,
        changed,
    }))
}

/// Remove an entry
pub async fn delete_entry(
    ledger: Ledger,
    req: HttpRequest,
    request: web::Json<DeleteEntryRequest>,
) -> Result<HttpResponse> {
    let actor = actor(&req)?;
    let removed = ledger
        .delete_entry(&actor, &request.account_id, request.entry_id)
        .await?;
    Ok(HttpResponse::Ok().json(json!({ "removed": removed })))
}

/// Flip an admin grant
pub async fn toggle_admin(
    ledger: Ledger,
    req: HttpRequest,
    request: web::Json<ToggleAdminRequest>,
) -> Result<HttpResponse> {
    let actor = actor(&req)?;
    let outcome = ledger.toggle_admin(&actor, &request.account_id).await?;
    Ok(HttpResponse::Ok().json(json!({
        "account_id": request.account_id,
        "outcome": outcome
    })))
}

/// Accounts holding the admin grant
pub async fn list_admins(ledger: Ledger, req: HttpRequest) -> Result<HttpResponse> {
    let actor = actor(&req)?;
    let admins = ledger.list_admins(&actor).await?;
    Ok(HttpResponse::Ok().json(admins))
}

/// Audit log search, newest first
pub async fn search_logs(
    ledger: Ledger,
    req: HttpRequest,
    query: web::Query<LogQuery>,
) -> Result<HttpResponse> {
    let actor = actor(&req)?;
    ledger.require_admin(&actor).await?;

    let page = ledger
        .search_audit_log(query.q.as_deref(), query.page.unwrap_or(1), query.page_size)
        .await?;

    Ok(HttpResponse::Ok().json(json!({
        "items": page.items,
        "total": page.total,
        "page": page.page,
        "page_size": page.page_size,
        "total_pages": page.total_pages()
    })))
}

/// Dump a table as JSON rows
pub async fn export_table(
    ledger: Ledger,
    req: HttpRequest,
    table: web::Path<String>,
) -> Result<HttpResponse> {
    let actor = actor(&req)?;
    let table: Table = table.parse()?;
    let rows = ledger.export_table(&actor, table).await?;

    Ok(HttpResponse::Ok().json(json!({
        "table": table.as_str(),
        "columns": table.columns(),
        "rows": rows
    })))
}

/// Configure routes
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/accounts", web::post().to(register))
            .route("/accounts/verify", web::post().to(verify))
            .route("/accounts/{account_id}", web::get().to(account_summary))
            .route("/accounts/{account_id}/entries", web::get().to(account_entries))
            .route("/admin/accounts", web::get().to(list_accounts))
            .route("/admin/adjust", web::post().to(adjust))
            .route("/admin/batch_adjust", web::post().to(batch_adjust))
            .route("/admin/entries/update", web::post().to(update_entry))
            .route("/admin/entries/delete", web::post().to(delete_entry))
            .route("/admin/toggle_admin", web::post().to(toggle_admin))
            .route("/admin/admins", web::get().to(list_admins))
            .route("/admin/logs", web::get().to(search_logs))
            .route("/admin/export/{table}", web::get().to(export_table)),
    )
    .route("/metrics", web::get().to(metrics_endpoint))
    .route("/health", web::get().to(health_check));
}
