use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelTrait, Set};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "accounts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub owner_id: String,
    pub name: Option<String>,
    pub person_email: Option<String>,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    pub opted_out: bool,
    /// One of: unknown, valid, risky, invalid
    pub email_validation_status: String,
    pub email_validation_score: Option<f64>,
    pub email_validated_at: Option<DateTimeUtc>,
    pub email_validation_reason: Option<String>,
    pub email_validation_details: Option<String>,
    pub created_at: DateTimeUtc,
}

impl Model {
    /// Dispatch address: `person_email` wins over the company `email`.
    pub fn primary_email(&self) -> Option<&str> {
        self.person_email
            .as_deref()
            .filter(|e| !e.is_empty())
            .or(self.email.as_deref().filter(|e| !e.is_empty()))
    }

    pub fn contact_name(&self) -> String {
        match (self.first_name.as_deref(), self.last_name.as_deref()) {
            (Some(f), Some(l)) if !f.is_empty() && !l.is_empty() => format!("{f} {l}"),
            (Some(f), _) if !f.is_empty() => f.to_string(),
            _ => self.name.clone().unwrap_or_default(),
        }
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::owners::Entity",
        from = "Column::OwnerId",
        to = "super::owners::Column::Id"
    )]
    Owner,
    #[sea_orm(has_many = "super::policies::Entity")]
    Policies,
}

impl Related<super::owners::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Owner.def()
    }
}

impl Related<super::policies::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Policies.def()
    }
}

impl ActiveModelBehavior for ActiveModel {
    fn new() -> Self {
        Self {
            id: Set(Uuid::new_v4().to_string()),
            opted_out: Set(false),
            email_validation_status: Set("unknown".to_string()),
            created_at: Set(chrono::Utc::now()),
            ..ActiveModelTrait::default()
        }
    }
}
