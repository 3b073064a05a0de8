use std::collections::HashMap;
use std::time::Instant;

use actix_web::{web, HttpResponse};
use chrono::{DateTime, TimeZone, Utc};
use futures_util::StreamExt;
use log::info;
use mongodb::bson::{
    doc, from_document, oid::ObjectId, to_bson, Bson, DateTime as BsonDateTime, Document,
};
use mongodb::options::ReturnDocument;
use serde::{Deserialize, Serialize};
use serde_json::json;
use slug::slugify;
use validator::{Validate, ValidationError};

use crate::app_state::AppState;
use crate::error::AppError;
use crate::query::ApiFeatures;
use crate::user::{credential_projection, User};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Difficult,
}

impl Difficulty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Difficult => "difficult",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum GeoType {
    #[default]
    Point,
}

/// GeoJSON point; `day` is only present for itinerary stops.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoLocation {
    #[serde(rename = "type", default)]
    pub kind: GeoType,
    pub coordinates: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tour {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub name: String,
    pub slug: String,
    pub duration: f64,
    pub max_group_size: i32,
    pub difficulty: Difficulty,
    #[serde(default = "default_ratings_average")]
    pub ratings_average: f64,
    #[serde(default)]
    pub ratings_quantity: i64,
    pub price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_discount: Option<f64>,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub image_cover: String,
    #[serde(default)]
    pub images: Vec<String>,
    /// Hidden bookkeeping field; projected away on every read and skipped in
    /// output when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<BsonDateTime>,
    #[serde(default)]
    pub start_dates: Vec<BsonDateTime>,
    #[serde(default)]
    pub secret_tour: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_location: Option<GeoLocation>,
    #[serde(default)]
    pub locations: Vec<GeoLocation>,
    /// Guide references resolved into full (credential-free) user records.
    #[serde(default)]
    pub guides: Vec<User>,
}

fn default_ratings_average() -> f64 {
    4.5
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
#[validate(schema(function = "discount_below_price"))]
pub struct CreateTourRequest {
    #[validate(length(
        min = 10,
        max = 40,
        message = "A tour name must have between 10 and 40 characters"
    ))]
    pub name: String,
    #[validate(range(exclusive_min = 0.0, message = "A tour duration must be positive"))]
    pub duration: f64,
    pub max_group_size: i32,
    pub difficulty: Difficulty,
    #[validate(range(min = 1.0, max = 5.0, message = "Rating must be between 1.0 and 5.0"))]
    pub ratings_average: Option<f64>,
    pub ratings_quantity: Option<i64>,
    pub price: f64,
    pub price_discount: Option<f64>,
    pub summary: String,
    pub description: Option<String>,
    pub image_cover: String,
    pub images: Option<Vec<String>>,
    pub start_dates: Option<Vec<DateTime<Utc>>>,
    pub secret_tour: Option<bool>,
    pub start_location: Option<GeoLocation>,
    pub locations: Option<Vec<GeoLocation>>,
    /// Raw user ids; resolved to full records before the insert.
    pub guides: Option<Vec<String>>,
}

// Only runs on creation. Updates go through UpdateTourRequest, which carries
// no discount rule.
fn discount_below_price(payload: &CreateTourRequest) -> Result<(), ValidationError> {
    if let Some(discount) = payload.price_discount {
        if discount >= payload.price {
            let mut error = ValidationError::new("price_discount");
            error.message = Some("Discount price should be below regular price".into());
            return Err(error);
        }
    }
    Ok(())
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTourRequest {
    #[validate(length(
        min = 10,
        max = 40,
        message = "A tour name must have between 10 and 40 characters"
    ))]
    pub name: Option<String>,
    #[validate(range(exclusive_min = 0.0, message = "A tour duration must be positive"))]
    pub duration: Option<f64>,
    pub max_group_size: Option<i32>,
    pub difficulty: Option<Difficulty>,
    #[validate(range(min = 1.0, max = 5.0, message = "Rating must be between 1.0 and 5.0"))]
    pub ratings_average: Option<f64>,
    pub ratings_quantity: Option<i64>,
    pub price: Option<f64>,
    pub price_discount: Option<f64>,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub image_cover: Option<String>,
    pub images: Option<Vec<String>>,
    pub start_dates: Option<Vec<DateTime<Utc>>>,
    pub secret_tour: Option<bool>,
    pub start_location: Option<GeoLocation>,
    pub locations: Option<Vec<GeoLocation>>,
    pub guides: Option<Vec<String>>,
}

impl Tour {
    /// Builds the document to insert: derives the slug, applies defaults and
    /// stamps the creation time. Guides must already be resolved.
    pub fn from_payload(payload: CreateTourRequest, guides: Vec<User>) -> Tour {
        let name = payload.name.trim().to_string();
        Tour {
            id: None,
            slug: slugify(&name),
            name,
            duration: payload.duration,
            max_group_size: payload.max_group_size,
            difficulty: payload.difficulty,
            ratings_average: payload.ratings_average.unwrap_or(4.5),
            ratings_quantity: payload.ratings_quantity.unwrap_or(0),
            price: payload.price,
            price_discount: payload.price_discount,
            summary: payload.summary.trim().to_string(),
            description: payload.description.map(|d| d.trim().to_string()),
            image_cover: payload.image_cover,
            images: payload.images.unwrap_or_default(),
            created_at: Some(BsonDateTime::now()),
            start_dates: payload
                .start_dates
                .unwrap_or_default()
                .into_iter()
                .map(|date| BsonDateTime::from_millis(date.timestamp_millis()))
                .collect(),
            secret_tour: payload.secret_tour.unwrap_or(false),
            start_location: payload.start_location,
            locations: payload.locations.unwrap_or_default(),
            guides,
        }
    }

    pub fn duration_weeks(&self) -> f64 {
        self.duration / 7.0
    }
}

impl UpdateTourRequest {
    /// Builds the `$set` document from the supplied fields. A changed name
    /// regenerates the slug.
    fn into_update_document(self) -> Result<Document, AppError> {
        let mut update = Document::new();
        if let Some(name) = self.name {
            let name = name.trim().to_string();
            update.insert("slug", slugify(&name));
            update.insert("name", name);
        }
        if let Some(duration) = self.duration {
            update.insert("duration", duration);
        }
        if let Some(max_group_size) = self.max_group_size {
            update.insert("maxGroupSize", max_group_size);
        }
        if let Some(difficulty) = self.difficulty {
            update.insert("difficulty", difficulty.as_str());
        }
        if let Some(ratings_average) = self.ratings_average {
            update.insert("ratingsAverage", ratings_average);
        }
        if let Some(ratings_quantity) = self.ratings_quantity {
            update.insert("ratingsQuantity", ratings_quantity);
        }
        if let Some(price) = self.price {
            update.insert("price", price);
        }
        if let Some(price_discount) = self.price_discount {
            update.insert("priceDiscount", price_discount);
        }
        if let Some(summary) = self.summary {
            update.insert("summary", summary.trim().to_string());
        }
        if let Some(description) = self.description {
            update.insert("description", description.trim().to_string());
        }
        if let Some(image_cover) = self.image_cover {
            update.insert("imageCover", image_cover);
        }
        if let Some(images) = self.images {
            update.insert("images", images);
        }
        if let Some(start_dates) = self.start_dates {
            let dates: Vec<Bson> = start_dates
                .into_iter()
                .map(|date| Bson::DateTime(BsonDateTime::from_millis(date.timestamp_millis())))
                .collect();
            update.insert("startDates", dates);
        }
        if let Some(secret_tour) = self.secret_tour {
            update.insert("secretTour", secret_tour);
        }
        if let Some(start_location) = self.start_location {
            update.insert("startLocation", to_bson(&start_location)?);
        }
        if let Some(locations) = self.locations {
            update.insert("locations", to_bson(&locations)?);
        }
        Ok(update)
    }
}

/// Every find-type read goes through this, so secret tours stay invisible
/// without the caller opting in.
pub fn without_secret_tours(mut filter: Document) -> Document {
    filter.insert("secretTour", doc! { "$ne": true });
    filter
}

/// The `$match` stage prepended to every aggregation for the same reason.
fn hidden_tour_stage() -> Document {
    doc! { "$match": { "secretTour": { "$ne": true } } }
}

async fn resolve_guides(data: &AppState, ids: &[String]) -> Result<Vec<User>, AppError> {
    let users_coll = data.mongodb.db.collection::<User>("users");
    let mut guides = Vec::with_capacity(ids.len());
    for raw in ids {
        let id = ObjectId::parse_str(raw)
            .map_err(|_| AppError::new(format!("Invalid guide id: {}", raw), 400))?;
        let user = users_coll
            .find_one(doc! { "_id": id })
            .projection(credential_projection())
            .await?
            .ok_or_else(|| AppError::new(format!("No user found with ID {}", raw), 400))?;
        guides.push(user);
    }
    Ok(guides)
}

/// Serialized form of a tour plus the derived `durationWeeks` attribute,
/// which is computed on read and never persisted.
fn with_virtuals(tour: &Tour) -> Result<serde_json::Value, AppError> {
    let mut value = serde_json::to_value(tour)?;
    if let Some(object) = value.as_object_mut() {
        object.insert("durationWeeks".to_string(), json!(tour.duration_weeks()));
    }
    Ok(value)
}

/// Same enrichment for raw (possibly projected) documents from a list read.
fn tour_json(doc: Document) -> serde_json::Value {
    let duration = match doc.get("duration") {
        Some(Bson::Double(d)) => Some(*d),
        Some(Bson::Int32(n)) => Some(*n as f64),
        Some(Bson::Int64(n)) => Some(*n as f64),
        _ => None,
    };
    let mut value = Bson::Document(doc).into_relaxed_extjson();
    if let (Some(duration), Some(object)) = (duration, value.as_object_mut()) {
        object.insert("durationWeeks".to_string(), json!(duration / 7.0));
    }
    value
}

async fn list_tours(
    data: &AppState,
    params: HashMap<String, String>,
) -> Result<HttpResponse, AppError> {
    let features = ApiFeatures::new(params)
        .filter()?
        .sort()
        .limit_fields()
        .paginate();

    let tours_coll = data.mongodb.db.collection::<Document>("tours");
    let start = Instant::now();
    let mut find = tours_coll
        .find(without_secret_tours(features.filter))
        .sort(features.sort)
        .skip(features.skip)
        .limit(features.limit);
    if let Some(projection) = features.projection {
        find = find.projection(projection);
    }

    let mut cursor = find.await?;
    let mut tours = Vec::new();
    while let Some(doc) = cursor.next().await {
        tours.push(tour_json(doc?));
    }
    info!("Query took {} ms", start.elapsed().as_millis());

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "results": tours.len(),
        "data": { "tours": tours },
    })))
}

pub async fn get_all_tours(
    data: web::Data<AppState>,
    query: web::Query<HashMap<String, String>>,
) -> Result<HttpResponse, AppError> {
    list_tours(&data, query.into_inner()).await
}

/// Preset listing: the five best-rated, cheapest-first tours with a reduced
/// field set.
pub async fn top_tours(
    data: web::Data<AppState>,
    query: web::Query<HashMap<String, String>>,
) -> Result<HttpResponse, AppError> {
    let mut params = query.into_inner();
    params.insert("limit".to_string(), "5".to_string());
    params.insert("sort".to_string(), "-ratingsAverage,price".to_string());
    params.insert(
        "fields".to_string(),
        "name,price,ratingsAverage,summary,difficulty".to_string(),
    );
    list_tours(&data, params).await
}

pub async fn get_tour(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let id = parse_object_id(&path.into_inner())?;
    let tours_coll = data.mongodb.db.collection::<Tour>("tours");

    let tour = tours_coll
        .find_one(without_secret_tours(doc! { "_id": id }))
        .projection(doc! { "createdAt": 0 })
        .await?
        .ok_or_else(|| AppError::new("No tour found with that ID", 404))?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "data": { "tour": with_virtuals(&tour)? },
    })))
}

pub async fn create_tour(
    data: web::Data<AppState>,
    payload: web::Json<CreateTourRequest>,
) -> Result<HttpResponse, AppError> {
    let mut payload = payload.into_inner();
    payload.validate()?;

    let tours_coll = data.mongodb.db.collection::<Tour>("tours");
    let name = payload.name.trim().to_string();
    if tours_coll.find_one(doc! { "name": &name }).await?.is_some() {
        return Err(AppError::new("A tour with that name already exists", 400));
    }

    let guides = match payload.guides.take() {
        Some(ids) => resolve_guides(&data, &ids).await?,
        None => Vec::new(),
    };

    let mut tour = Tour::from_payload(payload, guides);
    let inserted = tours_coll.insert_one(&tour).await?;
    tour.id = inserted.inserted_id.as_object_id();
    tour.created_at = None;
    info!("Tour created: {}", tour.slug);

    Ok(HttpResponse::Created().json(json!({
        "status": "success",
        "data": { "tour": with_virtuals(&tour)? },
    })))
}

pub async fn update_tour(
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<UpdateTourRequest>,
) -> Result<HttpResponse, AppError> {
    let mut payload = payload.into_inner();
    payload.validate()?;

    let id = parse_object_id(&path.into_inner())?;
    let guide_ids = payload.guides.take();
    let mut update = payload.into_update_document()?;
    if let Some(ids) = guide_ids {
        update.insert("guides", to_bson(&resolve_guides(&data, &ids).await?)?);
    }
    if update.is_empty() {
        return Err(AppError::new("No fields to update", 400));
    }

    let tours_coll = data.mongodb.db.collection::<Tour>("tours");
    let tour = tours_coll
        .find_one_and_update(without_secret_tours(doc! { "_id": id }), doc! { "$set": update })
        .return_document(ReturnDocument::After)
        .projection(doc! { "createdAt": 0 })
        .await?
        .ok_or_else(|| AppError::new("No tour found with that ID", 404))?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "data": { "tour": with_virtuals(&tour)? },
    })))
}

pub async fn delete_tour(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let id = parse_object_id(&path.into_inner())?;
    let tours_coll = data.mongodb.db.collection::<Tour>("tours");

    tours_coll
        .find_one_and_delete(without_secret_tours(doc! { "_id": id }))
        .await?
        .ok_or_else(|| AppError::new("No tour found with that ID", 404))?;

    Ok(HttpResponse::NoContent().finish())
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TourStats {
    #[serde(rename = "_id")]
    pub difficulty: String,
    pub num_tours: i64,
    pub num_ratings: i64,
    pub avg_rating: f64,
    pub avg_price: f64,
    pub min_price: f64,
    pub max_price: f64,
}

pub fn tour_stats_pipeline() -> Vec<Document> {
    vec![
        hidden_tour_stage(),
        doc! { "$match": { "ratingsAverage": { "$gte": 4.5 } } },
        doc! { "$group": {
            "_id": { "$toUpper": "$difficulty" },
            "numTours": { "$sum": 1 },
            "numRatings": { "$sum": "$ratingsQuantity" },
            "avgRating": { "$avg": "$ratingsAverage" },
            "avgPrice": { "$avg": "$price" },
            "minPrice": { "$min": "$price" },
            "maxPrice": { "$max": "$price" },
        } },
        doc! { "$sort": { "avgPrice": 1 } },
    ]
}

pub async fn tour_stats(data: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let tours_coll = data.mongodb.db.collection::<Tour>("tours");
    let mut cursor = tours_coll.aggregate(tour_stats_pipeline()).await?;

    let mut stats: Vec<TourStats> = Vec::new();
    while let Some(doc) = cursor.next().await {
        stats.push(from_document(doc?)?);
    }

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "data": { "stats": stats },
    })))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyPlanEntry {
    pub month: i32,
    pub num_tour_starts: i64,
    pub tours: Vec<String>,
}

pub fn monthly_plan_pipeline(year: i32) -> Result<Vec<Document>, AppError> {
    let from = Utc
        .with_ymd_and_hms(year, 1, 1, 0, 0, 0)
        .single()
        .ok_or_else(|| AppError::new("Invalid year", 400))?;
    let to = Utc
        .with_ymd_and_hms(year, 12, 31, 0, 0, 0)
        .single()
        .ok_or_else(|| AppError::new("Invalid year", 400))?;

    Ok(vec![
        hidden_tour_stage(),
        doc! { "$unwind": "$startDates" },
        doc! { "$match": {
            "startDates": {
                "$gte": BsonDateTime::from_millis(from.timestamp_millis()),
                "$lte": BsonDateTime::from_millis(to.timestamp_millis()),
            }
        } },
        doc! { "$group": {
            "_id": { "$month": "$startDates" },
            "numTourStarts": { "$sum": 1 },
            "tours": { "$push": "$name" },
        } },
        doc! { "$addFields": { "month": "$_id" } },
        doc! { "$project": { "_id": 0 } },
        doc! { "$sort": { "numTourStarts": -1 } },
    ])
}

pub async fn monthly_plan(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let year: i32 = path
        .into_inner()
        .parse()
        .map_err(|_| AppError::new("Year must be a number", 400))?;

    let tours_coll = data.mongodb.db.collection::<Tour>("tours");
    let mut cursor = tours_coll.aggregate(monthly_plan_pipeline(year)?).await?;

    let mut plan: Vec<MonthlyPlanEntry> = Vec::new();
    while let Some(doc) = cursor.next().await {
        plan.push(from_document(doc?)?);
    }

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "data": { "plan": plan },
    })))
}

fn parse_object_id(raw: &str) -> Result<ObjectId, AppError> {
    ObjectId::parse_str(raw).map_err(|_| AppError::new(format!("Invalid ID: {}", raw), 400))
}
