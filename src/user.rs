use actix_web::{web, HttpResponse};
use bcrypt::{hash, verify, DEFAULT_COST};
use futures_util::StreamExt;
use log::info;
use mongodb::bson::{doc, oid::ObjectId, DateTime as BsonDateTime, Document};
use mongodb::options::ReturnDocument;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use validator::Validate;

use crate::app_state::AppState;
use crate::error::AppError;

const RESET_TOKEN_TTL_MS: i64 = 10 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    #[default]
    User,
    Guide,
    LeadGuide,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Guide => "guide",
            Role::LeadGuide => "lead-guide",
            Role::Admin => "admin",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub photo: Option<String>,
    #[serde(default)]
    pub role: Role,
    /// Bcrypt hash. Every read projects it away, so it is `None` anywhere
    /// outside the write path and never serialized back out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_changed_at: Option<BsonDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_reset_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_reset_expires: Option<BsonDateTime>,
}

/// Projection applied to every user read so credential material stays in the
/// database.
pub fn credential_projection() -> Document {
    doc! {
        "password": 0,
        "passwordChangedAt": 0,
        "passwordResetToken": 0,
        "passwordResetExpires": 0,
    }
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserRequest {
    #[validate(length(min = 3, max = 40, message = "Name must have between 3 and 40 characters"))]
    pub name: String,
    #[validate(email(message = "Please provide a valid email"))]
    pub email: String,
    pub photo: Option<String>,
    pub role: Option<Role>,
    #[validate(length(min = 10, message = "A password must have at least 10 characters"))]
    pub password: String,
    #[validate(must_match(other = "password", message = "Passwords are not the same"))]
    pub password_confirm: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateUserRequest {
    #[validate(length(min = 3, max = 40, message = "Name must have between 3 and 40 characters"))]
    pub name: Option<String>,
    #[validate(email(message = "Please provide a valid email"))]
    pub email: Option<String>,
    pub photo: Option<String>,
    pub role: Option<Role>,
    #[validate(length(min = 10, message = "A password must have at least 10 characters"))]
    pub password: Option<String>,
}

impl User {
    /// Hashes the credentials and normalizes the email. The confirmation
    /// field is consumed here and never persisted.
    pub fn from_payload(payload: CreateUserRequest) -> Result<User, AppError> {
        let hashed = hash(&payload.password, DEFAULT_COST)?;
        Ok(User {
            id: None,
            name: payload.name,
            email: payload.email.to_lowercase(),
            photo: payload.photo,
            role: payload.role.unwrap_or_default(),
            password: Some(hashed),
            password_changed_at: None,
            password_reset_token: None,
            password_reset_expires: None,
        })
    }

    pub fn correct_password(candidate: &str, stored_hash: &str) -> Result<bool, AppError> {
        Ok(verify(candidate, stored_hash)?)
    }

    pub fn changed_password_after(&self, instant: BsonDateTime) -> bool {
        match self.password_changed_at {
            Some(changed) => changed > instant,
            None => false,
        }
    }

    /// Issues a single-use reset token. The plaintext goes back to the
    /// caller; only its SHA-256 hash is kept, alongside a 10 minute expiry.
    pub fn create_password_reset_token(&mut self) -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = hex::encode(bytes);

        self.password_reset_token = Some(hash_reset_token(&token));
        self.password_reset_expires = Some(BsonDateTime::from_millis(
            BsonDateTime::now().timestamp_millis() + RESET_TOKEN_TTL_MS,
        ));

        token
    }
}

pub fn hash_reset_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

impl UpdateUserRequest {
    /// Builds the `$set` document. Only a supplied password is re-hashed; an
    /// untouched one keeps its stored hash.
    fn into_update_document(self) -> Result<Document, AppError> {
        let mut update = Document::new();
        if let Some(name) = self.name {
            update.insert("name", name);
        }
        if let Some(email) = self.email {
            update.insert("email", email.to_lowercase());
        }
        if let Some(photo) = self.photo {
            update.insert("photo", photo);
        }
        if let Some(role) = self.role {
            update.insert("role", role.as_str());
        }
        if let Some(password) = self.password {
            update.insert("password", hash(&password, DEFAULT_COST)?);
            update.insert("passwordChangedAt", BsonDateTime::now());
        }
        Ok(update)
    }
}

pub async fn get_all_users(data: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let users_coll = data.mongodb.db.collection::<User>("users");
    let mut cursor = users_coll
        .find(doc! {})
        .projection(credential_projection())
        .await?;

    let mut users = Vec::new();
    while let Some(user) = cursor.next().await {
        users.push(user?);
    }

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "results": users.len(),
        "data": { "users": users },
    })))
}

pub async fn create_user(
    data: web::Data<AppState>,
    payload: web::Json<CreateUserRequest>,
) -> Result<HttpResponse, AppError> {
    let payload = payload.into_inner();
    payload.validate()?;

    let users_coll = data.mongodb.db.collection::<User>("users");
    let email = payload.email.to_lowercase();
    if users_coll.find_one(doc! { "email": &email }).await?.is_some() {
        return Err(AppError::new("A user with that email already exists", 400));
    }

    let mut user = User::from_payload(payload)?;
    let inserted = users_coll.insert_one(&user).await?;
    user.id = inserted.inserted_id.as_object_id();
    user.password = None;
    info!("User created: {}", user.email);

    Ok(HttpResponse::Created().json(json!({
        "status": "success",
        "data": { "user": user },
    })))
}

pub async fn update_user(
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<UpdateUserRequest>,
) -> Result<HttpResponse, AppError> {
    let payload = payload.into_inner();
    payload.validate()?;

    let id = parse_object_id(&path.into_inner())?;
    let update = payload.into_update_document()?;
    if update.is_empty() {
        return Err(AppError::new("No fields to update", 400));
    }

    let users_coll = data.mongodb.db.collection::<User>("users");
    let user = users_coll
        .find_one_and_update(doc! { "_id": id }, doc! { "$set": update })
        .return_document(ReturnDocument::After)
        .projection(credential_projection())
        .await?
        .ok_or_else(|| AppError::new("No user found with that ID", 404))?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "data": { "user": user },
    })))
}

fn parse_object_id(raw: &str) -> Result<ObjectId, AppError> {
    ObjectId::parse_str(raw).map_err(|_| AppError::new(format!("Invalid ID: {}", raw), 400))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> CreateUserRequest {
        CreateUserRequest {
            name: "Jonas Schmedtmann".to_string(),
            email: "Jonas@Example.COM".to_string(),
            photo: None,
            role: None,
            password: "pass1234word".to_string(),
            password_confirm: "pass1234word".to_string(),
        }
    }

    #[test]
    fn creation_hashes_the_password() {
        let user = User::from_payload(payload()).unwrap();
        let stored = user.password.unwrap();
        assert_ne!(stored, "pass1234word");
        assert!(User::correct_password("pass1234word", &stored).unwrap());
        assert!(!User::correct_password("wrong password", &stored).unwrap());
    }

    #[test]
    fn creation_lowercases_the_email() {
        let user = User::from_payload(payload()).unwrap();
        assert_eq!(user.email, "jonas@example.com");
    }

    #[test]
    fn role_defaults_to_user() {
        let user = User::from_payload(payload()).unwrap();
        assert_eq!(user.role, Role::User);
    }

    #[test]
    fn mismatched_confirmation_fails_validation() {
        let mut request = payload();
        request.password_confirm = "something else!".to_string();
        let err: AppError = request.validate().unwrap_err().into();
        assert_eq!(err.status_code, 400);
        assert!(err.message.contains("Passwords are not the same"));
    }

    #[test]
    fn short_passwords_fail_validation() {
        let mut request = payload();
        request.password = "short".to_string();
        request.password_confirm = "short".to_string();
        assert!(request.validate().is_err());
    }

    #[test]
    fn invalid_email_fails_validation() {
        let mut request = payload();
        request.email = "not-an-email".to_string();
        assert!(request.validate().is_err());
    }

    #[test]
    fn update_without_password_leaves_the_hash_alone() {
        let request = UpdateUserRequest {
            name: Some("New Name Here".to_string()),
            email: None,
            photo: None,
            role: None,
            password: None,
        };
        let update = request.into_update_document().unwrap();
        assert!(!update.contains_key("password"));
        assert!(!update.contains_key("passwordChangedAt"));
        assert_eq!(update.get_str("name").unwrap(), "New Name Here");
    }

    #[test]
    fn update_with_password_rehashes_and_stamps() {
        let request = UpdateUserRequest {
            name: None,
            email: None,
            photo: None,
            role: None,
            password: Some("brand-new-password".to_string()),
        };
        let update = request.into_update_document().unwrap();
        let stored = update.get_str("password").unwrap();
        assert_ne!(stored, "brand-new-password");
        assert!(User::correct_password("brand-new-password", stored).unwrap());
        assert!(update.contains_key("passwordChangedAt"));
    }

    #[test]
    fn reset_token_stores_its_sha256_hash() {
        let mut user = User::from_payload(payload()).unwrap();
        let before = BsonDateTime::now().timestamp_millis();
        let token = user.create_password_reset_token();
        let after = BsonDateTime::now().timestamp_millis();

        assert_eq!(token.len(), 64);
        assert_eq!(
            user.password_reset_token,
            Some(hash_reset_token(&token)),
        );

        let expires = user.password_reset_expires.unwrap().timestamp_millis();
        assert!(expires >= before + RESET_TOKEN_TTL_MS);
        assert!(expires <= after + RESET_TOKEN_TTL_MS);
    }

    #[test]
    fn reset_tokens_are_unique() {
        let mut user = User::from_payload(payload()).unwrap();
        let first = user.create_password_reset_token();
        let second = user.create_password_reset_token();
        assert_ne!(first, second);
    }

    #[test]
    fn changed_password_after_compares_against_the_stamp() {
        let mut user = User::from_payload(payload()).unwrap();
        assert!(!user.changed_password_after(BsonDateTime::from_millis(1_000)));

        user.password_changed_at = Some(BsonDateTime::from_millis(2_000));
        assert!(user.changed_password_after(BsonDateTime::from_millis(1_000)));
        assert!(!user.changed_password_after(BsonDateTime::from_millis(3_000)));
    }

    #[test]
    fn roles_serialize_kebab_case() {
        assert_eq!(serde_json::to_string(&Role::LeadGuide).unwrap(), "\"lead-guide\"");
        assert_eq!(
            serde_json::from_str::<Role>("\"lead-guide\"").unwrap(),
            Role::LeadGuide
        );
        assert_eq!(Role::LeadGuide.as_str(), "lead-guide");
    }

    #[test]
    fn serialized_users_never_carry_credentials() {
        let mut user = User::from_payload(payload()).unwrap();
        user.create_password_reset_token();
        user.password = None;
        user.password_reset_token = None;
        user.password_reset_expires = None;

        let value = serde_json::to_value(&user).unwrap();
        let object = value.as_object().unwrap();
        assert!(!object.contains_key("password"));
        assert!(!object.contains_key("passwordResetToken"));
        assert!(!object.contains_key("passwordResetExpires"));
    }
}
