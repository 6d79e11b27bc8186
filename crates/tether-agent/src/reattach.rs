use std::path::PathBuf;

use anyhow::Context;
use sea_orm::{DatabaseConnection, EntityTrait, Set, sea_query::OnConflict};
use tether_db::entities::reattach_information::{self, Column};
use tether_interop::{CompiledArtifact, ReattachInformation};
use tokio::io::AsyncWriteExt;

/// Keeps what a restarted supervisor needs to adopt the running engine process.
#[async_trait::async_trait]
pub trait ReattachPersistor: Send + Sync {
    async fn save(&self, info: &ReattachInformation) -> anyhow::Result<()>;

    /// Returns the saved record and forgets it, so a failing reattach is not retried
    /// forever.
    async fn load(&self) -> anyhow::Result<Option<ReattachInformation>>;

    async fn clear(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct JsonFileReattachPersistor {
    path: PathBuf,
}

impl JsonFileReattachPersistor {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait::async_trait]
impl ReattachPersistor for JsonFileReattachPersistor {
    async fn save(&self, info: &ReattachInformation) -> anyhow::Result<()> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .context("create reattach dir")?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(info).context("serialize reattach information")?;
        let mut f = tokio::fs::File::create(&tmp)
            .await
            .context("create reattach tmp file")?;
        f.write_all(&data).await.context("write reattach tmp file")?;
        f.flush().await.ok();
        tokio::fs::rename(&tmp, &self.path)
            .await
            .context("persist reattach information")?;
        Ok(())
    }

    async fn load(&self) -> anyhow::Result<Option<ReattachInformation>> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context("read reattach information"),
        };
        self.clear().await?;
        let info = serde_json::from_slice(&data).context("parse reattach information")?;
        Ok(Some(info))
    }

    async fn clear(&self) -> anyhow::Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("delete reattach information"),
        }
    }
}

/// One row per supervised instance in `reattach_information`.
#[derive(Debug)]
pub struct DatabaseReattachPersistor {
    db: DatabaseConnection,
    instance_id: String,
}

impl DatabaseReattachPersistor {
    pub fn new(db: DatabaseConnection, instance_id: impl Into<String>) -> Self {
        Self {
            db,
            instance_id: instance_id.into(),
        }
    }
}

fn to_model(
    instance_id: &str,
    info: &ReattachInformation,
) -> anyhow::Result<reattach_information::Model> {
    let launched_at = chrono::DateTime::<chrono::Utc>::from_timestamp_millis(
        i64::try_from(info.launched_at_unix_ms).unwrap_or(i64::MAX),
    )
    .context("launch time out of range")?;
    Ok(reattach_information::Model {
        instance_id: instance_id.to_string(),
        access_identifier: info.access_identifier.clone(),
        process_id: info.process_id as i64,
        port: info.port as i32,
        topic_port: info.topic_port.map(|p| p as i32),
        reboot_state: info.reboot_state.as_str().to_string(),
        engine_version: info.artifact.engine_version.to_string(),
        compile_job_id: info.artifact.compile_job_id,
        artifact_directory: info.artifact.directory.to_string_lossy().into_owned(),
        artifact_name: info.artifact.artifact_name.clone(),
        topic_request_timeout_ms: info.topic_request_timeout_ms as i64,
        interop_version: info.interop_version.map(|v| v.to_string()),
        security_level: info.security_level.keyword().to_string(),
        visibility: info.visibility.keyword().to_string(),
        custom_commands_json: serde_json::to_string(&info.custom_commands)
            .context("serialize custom commands")?,
        launched_at: launched_at.into(),
        updated_at: chrono::Utc::now().into(),
    })
}

fn from_model(m: reattach_information::Model) -> anyhow::Result<ReattachInformation> {
    Ok(ReattachInformation {
        access_identifier: m.access_identifier,
        process_id: u32::try_from(m.process_id).context("process id out of range")?,
        port: u16::try_from(m.port).context("port out of range")?,
        topic_port: m
            .topic_port
            .map(u16::try_from)
            .transpose()
            .context("topic port out of range")?,
        reboot_state: m.reboot_state.parse()?,
        artifact: CompiledArtifact {
            compile_job_id: m.compile_job_id,
            directory: PathBuf::from(m.artifact_directory),
            artifact_name: m.artifact_name,
            engine_version: m.engine_version.parse()?,
        },
        topic_request_timeout_ms: m.topic_request_timeout_ms.max(0) as u64,
        interop_version: m.interop_version.map(|v| v.parse()).transpose()?,
        security_level: m.security_level.parse()?,
        visibility: m.visibility.parse()?,
        custom_commands: serde_json::from_str(&m.custom_commands_json)
            .context("parse custom commands")?,
        launched_at_unix_ms: m.launched_at.timestamp_millis().max(0) as u64,
    })
}

fn to_active(m: reattach_information::Model) -> reattach_information::ActiveModel {
    reattach_information::ActiveModel {
        instance_id: Set(m.instance_id),
        access_identifier: Set(m.access_identifier),
        process_id: Set(m.process_id),
        port: Set(m.port),
        topic_port: Set(m.topic_port),
        reboot_state: Set(m.reboot_state),
        engine_version: Set(m.engine_version),
        compile_job_id: Set(m.compile_job_id),
        artifact_directory: Set(m.artifact_directory),
        artifact_name: Set(m.artifact_name),
        topic_request_timeout_ms: Set(m.topic_request_timeout_ms),
        interop_version: Set(m.interop_version),
        security_level: Set(m.security_level),
        visibility: Set(m.visibility),
        custom_commands_json: Set(m.custom_commands_json),
        launched_at: Set(m.launched_at),
        updated_at: Set(m.updated_at),
    }
}

#[async_trait::async_trait]
impl ReattachPersistor for DatabaseReattachPersistor {
    async fn save(&self, info: &ReattachInformation) -> anyhow::Result<()> {
        let model = to_active(to_model(&self.instance_id, info)?);
        reattach_information::Entity::insert(model)
            .on_conflict(
                OnConflict::column(Column::InstanceId)
                    .update_columns([
                        Column::AccessIdentifier,
                        Column::ProcessId,
                        Column::Port,
                        Column::TopicPort,
                        Column::RebootState,
                        Column::EngineVersion,
                        Column::CompileJobId,
                        Column::ArtifactDirectory,
                        Column::ArtifactName,
                        Column::TopicRequestTimeoutMs,
                        Column::InteropVersion,
                        Column::SecurityLevel,
                        Column::Visibility,
                        Column::CustomCommandsJson,
                        Column::LaunchedAt,
                        Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await
            .context("save reattach information")?;
        Ok(())
    }

    async fn load(&self) -> anyhow::Result<Option<ReattachInformation>> {
        let Some(model) = reattach_information::Entity::find_by_id(self.instance_id.clone())
            .one(&self.db)
            .await
            .context("load reattach information")?
        else {
            return Ok(None);
        };
        self.clear().await?;
        from_model(model).map(Some)
    }

    async fn clear(&self) -> anyhow::Result<()> {
        reattach_information::Entity::delete_by_id(self.instance_id.clone())
            .exec(&self.db)
            .await
            .context("delete reattach information")?;
        Ok(())
    }
}
