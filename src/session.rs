//! 播放会话
//! 状态机: Idle → Loading → Ready → Playing → Ended
//! 播放器本身在客户端，会话通过 `StreamEngine` 下发指令，任何时候最多只有一个播放器实例

use crate::episodes::{ordered_view, position_of};
use crate::error::EngineError;
use crate::history::HistoryStore;
use crate::http_client::stream_url;
use crate::types::{Episode, NormalizedWork, PlaybackRecord, SortOrder, WorkDetail};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

const ALL_PLAYED_NOTICE: &str = "全部剧集已播放完毕";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("当前没有正在播放的作品")]
    NotOpen,
    #[error("未找到剧集: {0}")]
    EpisodeNotFound(String),
    #[error("播放会话已变更，请重试")]
    Superseded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerState {
    Idle,
    Loading,
    Ready,
    Playing,
    Ended,
}

// ============================================================================
// 播放器
// ============================================================================

/// 下发给客户端播放器的指令
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PlayerCommand {
    Load { url: String },
    Seek { seconds: f64 },
    Play,
    Notice { message: String },
    Destroy,
}

/// 客户端播放器上报的事件
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PlayerEvent {
    Metadata { duration: f64 },
    Progress { position: f64, duration: f64 },
    Ended,
    Unsupported { format: String },
}

/// 播放器能力
pub trait StreamEngine: Send {
    fn load(&mut self, url: &str);
    fn seek(&mut self, seconds: f64);
    fn play(&mut self);
    fn notice(&mut self, message: &str);
    fn destroy(&mut self);
}

pub trait StreamEngineFactory: Send + Sync {
    fn create(&self) -> Box<dyn StreamEngine>;
}

/// 指令缓冲区，HTTP 接口每次返回时取走
#[derive(Debug, Clone, Default)]
pub struct CommandOutbox(Arc<Mutex<Vec<PlayerCommand>>>);

impl CommandOutbox {
    fn push(&self, command: PlayerCommand) {
        let mut queue = self.0.lock().unwrap_or_else(|e| e.into_inner());
        queue.push(command);
    }

    pub fn drain(&self) -> Vec<PlayerCommand> {
        let mut queue = self.0.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *queue)
    }
}

/// 把播放器调用转成指令的实现
pub struct CommandEngine {
    outbox: CommandOutbox,
    destroyed: bool,
}

impl StreamEngine for CommandEngine {
    fn load(&mut self, url: &str) {
        if !self.destroyed {
            self.outbox.push(PlayerCommand::Load {
                url: url.to_string(),
            });
        }
    }

    fn seek(&mut self, seconds: f64) {
        if !self.destroyed {
            self.outbox.push(PlayerCommand::Seek { seconds });
        }
    }

    fn play(&mut self) {
        if !self.destroyed {
            self.outbox.push(PlayerCommand::Play);
        }
    }

    fn notice(&mut self, message: &str) {
        if !self.destroyed {
            self.outbox.push(PlayerCommand::Notice {
                message: message.to_string(),
            });
        }
    }

    fn destroy(&mut self) {
        if !self.destroyed {
            self.destroyed = true;
            self.outbox.push(PlayerCommand::Destroy);
        }
    }
}

pub struct CommandEngineFactory {
    outbox: CommandOutbox,
}

impl CommandEngineFactory {
    pub fn new(outbox: CommandOutbox) -> Self {
        Self { outbox }
    }
}

impl StreamEngineFactory for CommandEngineFactory {
    fn create(&self) -> Box<dyn StreamEngine> {
        Box::new(CommandEngine {
            outbox: self.outbox.clone(),
            destroyed: false,
        })
    }
}

// ============================================================================
// 会话
// ============================================================================

/// 排序与跳过片头片尾设置
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackSettings {
    #[serde(default)]
    pub sort_order: SortOrder,
    #[serde(default)]
    pub skip_start_sec: u32,
    #[serde(default)]
    pub skip_end_sec: u32,
}

impl From<&PlaybackRecord> for PlaybackSettings {
    fn from(record: &PlaybackRecord) -> Self {
        Self {
            sort_order: record.sort_order,
            skip_start_sec: record.skip_start_sec,
            skip_end_sec: record.skip_end_sec,
        }
    }
}

struct Current {
    work: NormalizedWork,
    episodes: Vec<Episode>,
    index: usize,
    stream_relay: Option<String>,
    settings: PlaybackSettings,
    tail_skipped: bool,
}

/// 返回给客户端的会话快照
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerView {
    pub state: PlayerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work: Option<NormalizedWork>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub episode: Option<Episode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub episode_index: Option<usize>,
    /// 按当前排序方向排列
    pub episodes: Vec<Episode>,
    #[serde(flatten)]
    pub settings: PlaybackSettings,
    pub commands: Vec<PlayerCommand>,
}

impl PlayerView {
    pub fn with_commands(mut self, commands: Vec<PlayerCommand>) -> Self {
        self.commands = commands;
        self
    }
}

/// 起始剧集: 指定名称 → 播放记录 → 第一集
pub fn resolve_start(episodes: &[Episode], requested: Option<&str>, remembered: Option<&str>) -> usize {
    requested
        .and_then(|label| position_of(episodes, label))
        .or_else(|| remembered.and_then(|label| position_of(episodes, label)))
        .unwrap_or(0)
}

/// 按排序方向的下一集 (原始下标)
pub fn adjacent(index: usize, len: usize, order: SortOrder) -> Option<usize> {
    match order {
        SortOrder::Asc => Some(index + 1).filter(|&i| i < len),
        SortOrder::Desc => index.checked_sub(1),
    }
}

pub struct PlaybackSession {
    history: Arc<HistoryStore>,
    factory: Arc<dyn StreamEngineFactory>,
    engine: Option<Box<dyn StreamEngine>>,
    state: PlayerState,
    current: Option<Current>,
    // 每次打开或关闭都会加一
    generation: u64,
}

impl PlaybackSession {
    pub fn new(history: Arc<HistoryStore>, factory: Arc<dyn StreamEngineFactory>) -> Self {
        Self {
            history,
            factory,
            engine: None,
            state: PlayerState::Idle,
            current: None,
            generation: 0,
        }
    }

    pub fn state(&self) -> PlayerState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn current_label(&self) -> Option<&str> {
        let cur = self.current.as_ref()?;
        cur.episodes.get(cur.index).map(|ep| ep.label.as_str())
    }

    pub fn current_work(&self) -> Option<&NormalizedWork> {
        self.current.as_ref().map(|cur| &cur.work)
    }

    /// 打开作品，起始剧集按 指定名称 → 播放记录 → 第一集 选择
    pub fn open(
        &mut self,
        detail: WorkDetail,
        requested_label: Option<&str>,
        stream_relay: Option<String>,
    ) -> Result<(), SessionError> {
        if detail.episodes.is_empty() {
            return Err(EngineError::NoEpisodes.into());
        }

        let record = match self.history.find(&detail.work.id, &detail.work.source_key) {
            Ok(record) => record,
            Err(e) => {
                warn!("读取播放记录失败: {}", e);
                None
            }
        };
        let index = resolve_start(
            &detail.episodes,
            requested_label,
            record.as_ref().map(|r| r.episode_label.as_str()),
        );
        let settings = record.as_ref().map(PlaybackSettings::from).unwrap_or_default();

        self.start(detail, index, settings, stream_relay);
        Ok(())
    }

    /// 换源后从指定剧集继续，沿用当前的排序和跳过设置
    pub fn switch_to(
        &mut self,
        detail: WorkDetail,
        index: usize,
        stream_relay: Option<String>,
    ) -> Result<(), SessionError> {
        if index >= detail.episodes.len() {
            return Err(SessionError::EpisodeNotFound(index.to_string()));
        }
        let settings = self
            .current
            .as_ref()
            .map(|cur| cur.settings)
            .unwrap_or_default();
        self.start(detail, index, settings, stream_relay);
        Ok(())
    }

    /// 只有会话仍是 `generation` 那一次打开时才换源
    pub fn switch_from(
        &mut self,
        generation: u64,
        detail: WorkDetail,
        index: usize,
        stream_relay: Option<String>,
    ) -> Result<(), SessionError> {
        if self.generation != generation {
            return Err(SessionError::Superseded);
        }
        self.switch_to(detail, index, stream_relay)
    }

    fn start(
        &mut self,
        detail: WorkDetail,
        index: usize,
        settings: PlaybackSettings,
        stream_relay: Option<String>,
    ) {
        // 旧实例必须先销毁
        self.teardown();
        self.engine = Some(self.factory.create());

        info!(
            "开始播放: {} [{}] 第 {} 集",
            detail.work.title,
            detail.work.source_key,
            index + 1
        );
        self.current = Some(Current {
            work: detail.work,
            episodes: detail.episodes,
            index,
            stream_relay,
            settings,
            tail_skipped: false,
        });
        self.load_current();
    }

    fn load_current(&mut self) {
        let Some(cur) = self.current.as_mut() else {
            return;
        };
        cur.tail_skipped = false;
        let url = stream_url(cur.stream_relay.as_deref(), &cur.episodes[cur.index].stream_url);

        self.state = PlayerState::Loading;
        if let Some(engine) = self.engine.as_mut() {
            engine.load(&url);
        }
        self.persist();
    }

    fn persist(&self) {
        let Some(cur) = self.current.as_ref() else {
            return;
        };
        let record = PlaybackRecord {
            work_id: cur.work.id.clone(),
            source_key: cur.work.source_key.clone(),
            title: cur.work.title.clone(),
            poster_url: cur.work.poster_url.clone().unwrap_or_default(),
            episode_label: cur.episodes[cur.index].label.clone(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            sort_order: cur.settings.sort_order,
            skip_start_sec: cur.settings.skip_start_sec,
            skip_end_sec: cur.settings.skip_end_sec,
        };
        if let Err(e) = self.history.upsert(record) {
            warn!("保存播放记录失败: {}", e);
        }
    }

    pub fn handle(&mut self, event: PlayerEvent) {
        match event {
            PlayerEvent::Metadata { duration } => self.on_metadata(duration),
            PlayerEvent::Progress { position, duration } => self.on_progress(position, duration),
            PlayerEvent::Ended => self.on_ended(),
            PlayerEvent::Unsupported { format } => self.on_unsupported(&format),
        }
    }

    /// 元数据就绪: 跳过片头后自动播放
    pub fn on_metadata(&mut self, duration: f64) {
        if self.state != PlayerState::Loading {
            debug!("忽略元数据事件, 当前状态 {:?}", self.state);
            return;
        }
        let Some(cur) = self.current.as_ref() else {
            return;
        };
        let Some(engine) = self.engine.as_mut() else {
            return;
        };

        let skip_start = f64::from(cur.settings.skip_start_sec);
        if skip_start > 0.0 && skip_start < duration {
            engine.seek(skip_start);
        }
        self.state = PlayerState::Ready;

        engine.play();
        self.state = PlayerState::Playing;
    }

    /// 播放进度: 进入片尾窗口时跳到结尾，每集只跳一次
    pub fn on_progress(&mut self, position: f64, duration: f64) {
        if self.state != PlayerState::Playing {
            return;
        }
        let Some(cur) = self.current.as_mut() else {
            return;
        };

        let skip_end = f64::from(cur.settings.skip_end_sec);
        if skip_end <= 0.0 || cur.tail_skipped || duration <= 0.0 {
            return;
        }
        if duration - position <= skip_end {
            cur.tail_skipped = true;
            if let Some(engine) = self.engine.as_mut() {
                engine.seek(duration);
            }
        }
    }

    /// 播放结束: 按排序方向切到相邻剧集，没有则停在结束状态
    pub fn on_ended(&mut self) {
        if !matches!(self.state, PlayerState::Playing | PlayerState::Ready) {
            return;
        }
        let Some(cur) = self.current.as_mut() else {
            return;
        };

        match adjacent(cur.index, cur.episodes.len(), cur.settings.sort_order) {
            Some(next) => {
                cur.index = next;
                self.load_current();
            }
            None => {
                self.state = PlayerState::Ended;
                if let Some(engine) = self.engine.as_mut() {
                    engine.notice(ALL_PLAYED_NOTICE);
                }
            }
        }
    }

    /// 客户端无法播放: 提示后停止，不重试也不切集
    pub fn on_unsupported(&mut self, format: &str) {
        if self.current.is_none() {
            return;
        }
        let message = EngineError::StreamUnsupported(format.to_string()).to_string();
        warn!("{}", message);
        if let Some(engine) = self.engine.as_mut() {
            engine.notice(&message);
        }
        self.state = PlayerState::Ended;
    }

    /// 按原始下标选集
    pub fn select_episode(&mut self, index: usize) -> Result<(), SessionError> {
        let cur = self.current.as_mut().ok_or(SessionError::NotOpen)?;
        if index >= cur.episodes.len() {
            return Err(SessionError::EpisodeNotFound(index.to_string()));
        }
        cur.index = index;
        self.load_current();
        Ok(())
    }

    pub fn select_label(&mut self, label: &str) -> Result<(), SessionError> {
        let cur = self.current.as_ref().ok_or(SessionError::NotOpen)?;
        let index = position_of(&cur.episodes, label)
            .ok_or_else(|| SessionError::EpisodeNotFound(label.to_string()))?;
        self.select_episode(index)
    }

    /// 修改排序方向，不改变当前剧集
    pub fn set_sort_order(&mut self, order: SortOrder) -> Result<(), SessionError> {
        let cur = self.current.as_mut().ok_or(SessionError::NotOpen)?;
        cur.settings.sort_order = order;
        self.persist();
        Ok(())
    }

    /// 修改跳过片头片尾秒数，不改变当前剧集
    pub fn set_skip(&mut self, skip_start_sec: u32, skip_end_sec: u32) -> Result<(), SessionError> {
        let cur = self.current.as_mut().ok_or(SessionError::NotOpen)?;
        cur.settings.skip_start_sec = skip_start_sec;
        cur.settings.skip_end_sec = skip_end_sec;
        self.persist();
        Ok(())
    }

    /// 销毁播放器并回到 Idle
    pub fn teardown(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            engine.destroy();
        }
        self.current = None;
        self.state = PlayerState::Idle;
        self.generation += 1;
    }

    pub fn view(&self) -> PlayerView {
        let Some(cur) = self.current.as_ref() else {
            return PlayerView {
                state: self.state,
                work: None,
                episode: None,
                episode_index: None,
                episodes: Vec::new(),
                settings: PlaybackSettings::default(),
                commands: Vec::new(),
            };
        };

        PlayerView {
            state: self.state,
            work: Some(cur.work.clone()),
            episode: cur.episodes.get(cur.index).cloned(),
            episode_index: Some(cur.index),
            episodes: ordered_view(&cur.episodes, cur.settings.sort_order)
                .into_iter()
                .cloned()
                .collect(),
            settings: cur.settings,
            commands: Vec::new(),
        }
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        self.teardown();
    }
}
