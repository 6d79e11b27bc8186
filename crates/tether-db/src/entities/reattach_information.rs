use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "reattach_information")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub instance_id: String,
    pub access_identifier: String,
    pub process_id: i64,
    pub port: i32,
    pub topic_port: Option<i32>,
    pub reboot_state: String,
    pub engine_version: String,
    pub compile_job_id: i64,
    pub artifact_directory: String,
    pub artifact_name: String,
    pub topic_request_timeout_ms: i64,
    pub interop_version: Option<String>,
    pub security_level: String,
    pub visibility: String,
    pub custom_commands_json: String,
    pub launched_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
