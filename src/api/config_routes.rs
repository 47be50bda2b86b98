//! CRUD routes under `/config/{ae|source|destination}` (`spec.md` §6) over
//! the three `AeManager`-owned tables.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};

use crate::ae_manager::AeManagerError;
use crate::entities::{ApplicationEntity, DestinationApplicationEntity, SourceApplicationEntity};
use crate::AppState;

pub fn routes() -> Router<AppState> {
	Router::new()
		.route("/config/ae", get(list_aes).post(put_ae))
		.route("/config/ae/{name}", get(get_ae).delete(delete_ae))
		.route("/config/destination", get(list_destinations).post(put_destination))
		.route("/config/destination/{name}", get(get_destination).delete(delete_destination))
		.route("/config/source", get(list_sources).post(put_source))
		.route("/config/source/{aet}", get(get_source).delete(delete_source))
}

/// Maps an [`AeManagerError`] onto the `400`/`500` split of §6's CRUD
/// contract: malformed input (bad AE-title, unresolvable processor) is a
/// client error, anything else is a persistence failure.
fn ae_manager_error_response(err: AeManagerError) -> (StatusCode, String) {
	match &err {
		AeManagerError::InvalidAeTitle(_) | AeManagerError::UnknownProcessor(_) => {
			(StatusCode::BAD_REQUEST, err.to_string())
		}
		AeManagerError::Gateway(_) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
	}
}

async fn list_aes(State(state): State<AppState>) -> impl IntoResponse {
	match state.ae_manager.list_application_entities().await {
		Ok(entities) => Json(entities).into_response(),
		Err(err) => ae_manager_error_response(err).into_response(),
	}
}

async fn get_ae(State(state): State<AppState>, Path(name): Path<String>) -> impl IntoResponse {
	match state.ae_manager.find_application_entity(&name).await {
		Ok(Some(entity)) => Json(entity).into_response(),
		Ok(None) => StatusCode::NOT_FOUND.into_response(),
		Err(err) => ae_manager_error_response(err).into_response(),
	}
}

async fn put_ae(State(state): State<AppState>, Json(entity): Json<ApplicationEntity>) -> impl IntoResponse {
	match state.ae_manager.put_application_entity(entity).await {
		Ok(()) => StatusCode::CREATED.into_response(),
		Err(err) => ae_manager_error_response(err).into_response(),
	}
}

async fn delete_ae(State(state): State<AppState>, Path(name): Path<String>) -> impl IntoResponse {
	match state.ae_manager.remove_application_entity(&name).await {
		Ok(()) => StatusCode::NO_CONTENT.into_response(),
		Err(err) => ae_manager_error_response(err).into_response(),
	}
}

async fn list_destinations(State(state): State<AppState>) -> impl IntoResponse {
	match state.ae_manager.list_destinations().await {
		Ok(entities) => Json(entities).into_response(),
		Err(err) => ae_manager_error_response(err).into_response(),
	}
}

async fn get_destination(State(state): State<AppState>, Path(name): Path<String>) -> impl IntoResponse {
	match state.ae_manager.find_destination(&name).await {
		Ok(Some(entity)) => Json(entity).into_response(),
		Ok(None) => StatusCode::NOT_FOUND.into_response(),
		Err(err) => ae_manager_error_response(err).into_response(),
	}
}

async fn put_destination(
	State(state): State<AppState>,
	Json(entity): Json<DestinationApplicationEntity>,
) -> impl IntoResponse {
	match state.ae_manager.put_destination(entity).await {
		Ok(()) => StatusCode::CREATED.into_response(),
		Err(err) => ae_manager_error_response(err).into_response(),
	}
}

async fn delete_destination(State(state): State<AppState>, Path(name): Path<String>) -> impl IntoResponse {
	match state.ae_manager.remove_destination(&name).await {
		Ok(()) => StatusCode::NO_CONTENT.into_response(),
		Err(err) => ae_manager_error_response(err).into_response(),
	}
}

async fn list_sources(State(state): State<AppState>) -> impl IntoResponse {
	match state.ae_manager.list_sources().await {
		Ok(entities) => Json(entities).into_response(),
		Err(err) => ae_manager_error_response(err).into_response(),
	}
}

async fn get_source(State(state): State<AppState>, Path(aet): Path<String>) -> impl IntoResponse {
	match state.ae_manager.list_sources().await {
		Ok(entities) => entities
			.into_iter()
			.find(|source| source.aet.as_str() == aet)
			.map_or(StatusCode::NOT_FOUND.into_response(), |source| Json(source).into_response()),
		Err(err) => ae_manager_error_response(err).into_response(),
	}
}

async fn put_source(State(state): State<AppState>, Json(entity): Json<SourceApplicationEntity>) -> impl IntoResponse {
	match state.ae_manager.put_source(entity).await {
		Ok(()) => StatusCode::CREATED.into_response(),
		Err(err) => ae_manager_error_response(err).into_response(),
	}
}

async fn delete_source(State(state): State<AppState>, Path(aet): Path<String>) -> impl IntoResponse {
	match state.ae_manager.remove_source(&aet).await {
		Ok(()) => StatusCode::NO_CONTENT.into_response(),
		Err(err) => ae_manager_error_response(err).into_response(),
	}
}
