use crate::core::state::{
    AudioStatus, BeatTexts, ChapterPlan, CharacterRoster, IdeaVariation, PlotOutline,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;

/// The persisted aggregate as returned by the state endpoint. Every field
/// defaults so a partial or slightly malformed payload degrades to absence
/// instead of failing the load.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct AggregateSnapshot {
    #[serde(default)]
    pub selected: Option<IdeaVariation>,
    #[serde(default)]
    pub plot: Option<PlotOutline>,
    #[serde(default)]
    pub characters: CharacterRoster,
    #[serde(default = "default_chapter")]
    pub chapter: u32,
    #[serde(default)]
    pub beats: Option<ChapterPlan>,
    /// JSON object keys are strings even for numeric beat indices.
    #[serde(default)]
    pub beat_texts: HashMap<String, String>,
}

fn default_chapter() -> u32 {
    1
}

impl AggregateSnapshot {
    /// Non-numeric keys are dropped rather than raised.
    pub fn beat_texts_by_index(&self) -> BeatTexts {
        self.beat_texts
            .iter()
            .filter_map(|(k, v)| k.parse::<usize>().ok().map(|i| (i, v.clone())))
            .collect()
    }
}

#[derive(Debug, Serialize, Clone)]
pub struct ChapterPlanRequest {
    pub chapter: u32,
    pub title: String,
    pub genre: String,
    pub chapter_title: String,
    pub chapter_summary: String,
    pub characters: Vec<String>,
}

#[derive(Debug, Serialize, Default, Clone)]
pub struct CharacterPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct AudioStatusItem {
    pub beat_index: usize,
    pub provider: String,
    #[serde(default)]
    pub exists: bool,
    #[serde(default)]
    pub status: AudioStatus,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct AudioAck {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub status: AudioStatus,
    #[serde(default)]
    pub provider: String,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct ProjectInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub language: String,
}

/// The stage endpoints of the backend, as one opaque request/response
/// boundary. The manager and orchestrator depend on this trait only, so
/// tests inject recording fakes.
#[async_trait]
pub trait Gateway: Send + Sync + Debug {
    async fn load_state(&self, chapter: u32) -> Result<AggregateSnapshot>;
    async fn refine_idea(&self, genre: &str, idea: &str) -> Result<Vec<IdeaVariation>>;
    async fn generate_plot(&self, selection: &IdeaVariation) -> Result<PlotOutline>;
    async fn generate_characters(
        &self,
        title: &str,
        genre: &str,
        plot_summary: &str,
    ) -> Result<CharacterRoster>;
    async fn delete_character(&self, id: i64) -> Result<()>;
    async fn update_character(&self, id: i64, patch: &CharacterPatch) -> Result<()>;
    async fn plan_chapter(&self, req: &ChapterPlanRequest) -> Result<ChapterPlan>;
    async fn write_beat(&self, chapter: u32, index: usize) -> Result<String>;
    async fn clear_beat(&self, chapter: u32, index: usize) -> Result<()>;
    async fn clear_from(&self, chapter: u32, index: usize) -> Result<()>;
    async fn rebuild_continuity(&self, chapter: u32) -> Result<()>;
    async fn request_audio(
        &self,
        chapter: u32,
        index: usize,
        provider: &str,
        force: bool,
    ) -> Result<AudioAck>;
    async fn audio_status(&self, chapter: u32) -> Result<Vec<AudioStatusItem>>;
    async fn reset_project(&self) -> Result<()>;

    async fn list_projects(&self) -> Result<Vec<ProjectInfo>>;
    async fn create_project(&self, title: &str, language: &str) -> Result<ProjectInfo>;
    async fn delete_project(&self, id: &str) -> Result<()>;
}

// --- HTTP implementation ---

#[derive(Debug)]
pub struct HttpGateway {
    base_url: String,
    project: String,
    client: reqwest::Client,
}

impl HttpGateway {
    pub fn new(base_url: &str, project: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            project: project.to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn project_url(&self, path: &str) -> String {
        format!("{}/api/projects/{}{}", self.base_url, self.project, path)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
        if resp.status().is_success() {
            Ok(resp)
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(anyhow!("Server error {}: {}", status, body))
        }
    }
}

#[derive(Deserialize)]
struct RefineResponse {
    #[serde(default)]
    options: Vec<IdeaVariation>,
}

#[derive(Deserialize)]
struct WriteBeatResponse {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct AudioStatusResponse {
    #[serde(default)]
    items: Vec<AudioStatusItem>,
}

#[derive(Deserialize)]
struct ProjectListResponse {
    #[serde(default)]
    items: Vec<ProjectInfo>,
}

#[derive(Deserialize)]
struct ProjectCreateResponse {
    project: ProjectInfo,
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn load_state(&self, chapter: u32) -> Result<AggregateSnapshot> {
        let resp = self
            .client
            .get(self.project_url("/state"))
            .query(&[("chapter", chapter)])
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    async fn refine_idea(&self, genre: &str, idea: &str) -> Result<Vec<IdeaVariation>> {
        let resp = self
            .client
            .post(self.project_url("/refine"))
            .json(&serde_json::json!({ "genre": genre, "idea": idea }))
            .send()
            .await?;
        let parsed: RefineResponse = Self::check(resp).await?.json().await?;
        Ok(parsed.options)
    }

    async fn generate_plot(&self, selection: &IdeaVariation) -> Result<PlotOutline> {
        let resp = self
            .client
            .post(self.project_url("/plot"))
            .json(selection)
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    async fn generate_characters(
        &self,
        title: &str,
        genre: &str,
        plot_summary: &str,
    ) -> Result<CharacterRoster> {
        let resp = self
            .client
            .post(self.project_url("/characters"))
            .json(&serde_json::json!({
                "title": title,
                "genre": genre,
                "plot_summary": plot_summary,
            }))
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    async fn delete_character(&self, id: i64) -> Result<()> {
        let resp = self
            .client
            .delete(self.project_url(&format!("/characters/{}", id)))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn update_character(&self, id: i64, patch: &CharacterPatch) -> Result<()> {
        let resp = self
            .client
            .patch(self.project_url(&format!("/characters/{}", id)))
            .json(patch)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn plan_chapter(&self, req: &ChapterPlanRequest) -> Result<ChapterPlan> {
        let resp = self
            .client
            .post(self.project_url("/chapter_plan"))
            .json(req)
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    async fn write_beat(&self, chapter: u32, index: usize) -> Result<String> {
        let resp = self
            .client
            .get(self.project_url("/write_beat"))
            .query(&[("chapter", chapter as usize), ("beat_index", index)])
            .send()
            .await?;
        let parsed: WriteBeatResponse = Self::check(resp).await?.json().await?;

        // The route reports plan/index problems in-band with a 200.
        if let Some(error) = parsed.error {
            return Err(anyhow!("write_beat rejected: {}", error));
        }
        parsed
            .text
            .ok_or_else(|| anyhow!("write_beat response missing text"))
    }

    async fn clear_beat(&self, chapter: u32, index: usize) -> Result<()> {
        let resp = self
            .client
            .post(self.project_url("/beat/clear"))
            .json(&serde_json::json!({ "chapter": chapter, "beat_index": index }))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn clear_from(&self, chapter: u32, index: usize) -> Result<()> {
        let resp = self
            .client
            .post(self.project_url("/beat/clear_from"))
            .json(&serde_json::json!({ "chapter": chapter, "from_beat_index": index }))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn rebuild_continuity(&self, chapter: u32) -> Result<()> {
        let resp = self
            .client
            .post(self.project_url("/chapter/continuity"))
            .json(&serde_json::json!({ "chapter": chapter }))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn request_audio(
        &self,
        chapter: u32,
        index: usize,
        provider: &str,
        force: bool,
    ) -> Result<AudioAck> {
        let resp = self
            .client
            .post(self.project_url("/audio/generate"))
            .json(&serde_json::json!({
                "chapter": chapter,
                "beat_index": index,
                "provider": provider,
                "force": force,
            }))
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    async fn audio_status(&self, chapter: u32) -> Result<Vec<AudioStatusItem>> {
        let resp = self
            .client
            .get(self.project_url("/audio/status"))
            .query(&[("chapter", chapter)])
            .send()
            .await?;
        let parsed: AudioStatusResponse = Self::check(resp).await?.json().await?;
        Ok(parsed.items)
    }

    async fn reset_project(&self) -> Result<()> {
        let resp = self.client.post(self.project_url("/reset")).send().await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn list_projects(&self) -> Result<Vec<ProjectInfo>> {
        let resp = self
            .client
            .get(format!("{}/api/projects", self.base_url))
            .send()
            .await?;
        let parsed: ProjectListResponse = Self::check(resp).await?.json().await?;
        Ok(parsed.items)
    }

    async fn create_project(&self, title: &str, language: &str) -> Result<ProjectInfo> {
        let resp = self
            .client
            .post(format!("{}/api/projects", self.base_url))
            .json(&serde_json::json!({ "title": title, "language": language }))
            .send()
            .await?;
        let parsed: ProjectCreateResponse = Self::check(resp).await?.json().await?;
        Ok(parsed.project)
    }

    async fn delete_project(&self, id: &str) -> Result<()> {
        let resp = self
            .client
            .delete(format!("{}/api/projects/{}", self.base_url, id))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }
}
