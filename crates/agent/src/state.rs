//! Application state wiring: clients, stores, registry, executor, and the
//! prompt/context machinery, threaded through the runtime as one `Arc`.

use std::sync::Arc;
use std::time::Duration;

use valet_domain::config::Config;
use valet_domain::error::Result;
use valet_llm::traits::ChatClient;
use valet_llm::LlmClient;
use valet_memory::{KeywordRetriever, MemoryRetriever, MemoryStore};
use valet_sessions::{SessionStore, TranscriptWriter};
use valet_tools::builtin::register_builtins;
use valet_tools::{ToolExecutor, ToolRegistry};

use crate::context::ContextManager;
use crate::prompt::PromptAssembler;
use crate::scheduler::ScheduleStore;
use crate::task::TaskRegistry;

pub struct AppState {
    pub config: Config,
    pub llm: Arc<dyn ChatClient>,
    pub sessions: Arc<SessionStore>,
    pub transcripts: Arc<TranscriptWriter>,
    pub executor: Arc<ToolExecutor>,
    pub tasks: Arc<TaskRegistry>,
    pub memory: Arc<MemoryStore>,
    pub schedules: Arc<ScheduleStore>,
    pub prompt: PromptAssembler,
    pub context: ContextManager,
}

impl AppState {
    /// Production wiring: real LLM clients from config, built-in tools plus
    /// the host tools (memory, scheduler).
    pub fn new(config: Config) -> Result<Arc<Self>> {
        let llm: Arc<dyn ChatClient> = Arc::new(LlmClient::from_config(
            &config.endpoints,
            &config.network,
            config.settings.clone(),
        ));
        // The compiler pool serves summarization; it falls back to the
        // primary endpoints when not configured.
        let compiler: Arc<dyn ChatClient> = if config.compiler_endpoints.is_empty() {
            llm.clone()
        } else {
            Arc::new(LlmClient::from_config(
                &config.compiler_endpoints,
                &config.network,
                config.settings.clone(),
            ))
        };

        let registry = Arc::new(ToolRegistry::new());
        let files_root = config.workspace.state_dir.join("workspace");
        std::fs::create_dir_all(&files_root)?;
        register_builtins(
            &registry,
            &files_root,
            Duration::from_secs(config.tools.exec_timeout_secs),
        );

        Self::build(config, llm, compiler, registry)
    }

    /// Wiring with injected clients and registry (tests use mocks here).
    pub fn build(
        config: Config,
        llm: Arc<dyn ChatClient>,
        compiler: Arc<dyn ChatClient>,
        registry: Arc<ToolRegistry>,
    ) -> Result<Arc<Self>> {
        let sessions = Arc::new(SessionStore::new(&config.workspace.state_dir)?);
        let transcripts = Arc::new(TranscriptWriter::new(&sessions.transcript_dir()));
        let memory = Arc::new(MemoryStore::open(
            &config.workspace.state_dir,
            config.memory.dedupe_threshold,
        )?);
        let schedules = Arc::new(ScheduleStore::open(&config.workspace.state_dir)?);

        let retriever: Arc<dyn MemoryRetriever> = Arc::new(KeywordRetriever::new(memory.clone()));
        crate::host_tools::register(&registry, memory.clone(), schedules.clone());

        let executor = Arc::new(ToolExecutor::new(
            registry.clone(),
            config.tools.max_parallel,
            config.tools.result_guard_bytes,
        ));

        let prompt = PromptAssembler::new(
            config.prompt.clone(),
            config.memory.clone(),
            config.workspace.identity_dir.clone(),
            retriever,
            registry,
        );
        let context = ContextManager::new(config.context.clone(), compiler);

        Ok(Arc::new(Self {
            config,
            llm,
            sessions,
            transcripts,
            executor,
            tasks: Arc::new(TaskRegistry::new()),
            memory,
            schedules,
            prompt,
            context,
        }))
    }
}
