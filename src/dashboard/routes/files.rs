use axum::extract::State;
use axum::Form;
use serde::Deserialize;

use super::ControlState;

#[derive(Debug, Deserialize)]
pub struct PasswordForm {
    #[serde(default)]
    pub password: String,
}

pub async fn checkpw(State(state): State<ControlState>, Form(form): Form<PasswordForm>) -> &'static str {
    if state.folders.check(&form.password) {
        "ok"
    } else {
        "no"
    }
}

pub async fn delete_folder(
    State(state): State<ControlState>,
    Form(form): Form<PasswordForm>,
) -> &'static str {
    if state.folders.delete(&form.password).await {
        "success"
    } else {
        "error"
    }
}

pub async fn recreate_folder(
    State(state): State<ControlState>,
    Form(form): Form<PasswordForm>,
) -> &'static str {
    if state.folders.recreate(&form.password).await {
        "success"
    } else {
        "error"
    }
}
