//! The REST surface (`spec.md` §6): inference submission/status, AE/source/
//! destination configuration CRUD, and health probes.

pub mod config_routes;
pub mod health;
pub mod inference;

use axum::Router;

use crate::AppState;

pub fn routes(base_path: &str) -> Router<AppState> {
	let router = Router::new()
		.merge(inference::routes())
		.merge(config_routes::routes())
		.merge(health::routes());

	// axum no longer supports nesting at the root
	match base_path {
		"/" | "" => router,
		base_path => Router::new().nest(base_path, router),
	}
}
