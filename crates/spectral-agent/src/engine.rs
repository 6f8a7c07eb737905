use crate::archive::CodeArchive;
use crate::chat::AssistantSession;
use crate::codegen::DirectExecutor;
use crate::dispatcher::{Dispatcher, RetryPolicy};
use crate::executor::ExecutorServer;
use crate::intent::ResponseGenerator;
use crate::planner::Planner;
use crate::verifier::StepVerifier;
use anyhow::Result;
use spectral_core::{AppConfig, MemoryKind};
use spectral_llm::LlmClient;
use spectral_memory::MemoryService;
use spectral_observe::Observer;
use spectral_rag::RagService;
use spectral_sandbox::SandboxManager;
use spectral_store::{JsonBackend, SqliteBackend, StorageBackend};
use spectral_tools::{ActionHost, ActionRouter, PathPolicy};
use std::sync::Arc;

/// Wires the process-wide services (memory, RAG, tool registry) and hands
/// them to the pipeline by reference. Everything is configured here at
/// startup; shutdown flushes and closes storage.
pub struct Engine {
    pub memory: Arc<MemoryService>,
    pub rag: Arc<RagService>,
    session: AssistantSession,
}

impl Engine {
    pub fn new(cfg: AppConfig, llm: Arc<dyn LlmClient>) -> Result<Self> {
        let data_dir = spectral_core::data_dir();
        std::fs::create_dir_all(&data_dir)?;
        std::fs::create_dir_all(spectral_core::tool_knowledge_dir())?;

        let backend: Arc<dyn StorageBackend> = match cfg.memory.backend.as_str() {
            "json" => Arc::new(JsonBackend::open(&spectral_core::memory_dir())?),
            _ => Arc::new(SqliteBackend::open(&spectral_core::memory_dir())?),
        };
        let memory = Arc::new(MemoryService::new(backend));
        let rag = Arc::new(RagService::new(memory.clone(), cfg.rag.clone()));
        let observer = Arc::new(Observer::new(&data_dir)?);

        let router = Arc::new(ActionRouter::with_defaults(PathPolicy::from_config(
            &cfg.paths,
        )));
        router.set_dry_run(cfg.paths.dry_run);
        let verifier = StepVerifier::new()
            .with_pointer(router.pointer())
            .with_registry(router.registry_hive());
        let host: Arc<dyn ActionHost> = router;

        let planner = Planner::new(llm.clone(), host.clone())
            .with_rag(rag.clone(), cfg.rag.top_k)
            .with_safety_validation(cfg.safety.enable_safety_validation);
        let executor = Arc::new(
            ExecutorServer::new(host, verifier)
                .with_verification(cfg.safety.enable_verification),
        );
        let dispatcher = Dispatcher::new(executor, RetryPolicy::from_config(&cfg.retry));
        let direct = DirectExecutor::new(
            llm.clone(),
            SandboxManager::new(cfg.sandbox.clone()),
            memory.clone(),
            CodeArchive::new(),
            cfg.retry.clone(),
        );
        let responder = ResponseGenerator::new(llm);

        let session = AssistantSession::new(
            planner,
            dispatcher,
            direct,
            memory.clone(),
            responder,
            observer,
            cfg.memory.conversation_context_turns,
        );

        Ok(Self {
            memory,
            rag,
            session,
        })
    }

    pub fn process_command(&self, text: &str) -> String {
        self.session.process_command(text)
    }

    pub fn process_command_stream(&self, text: &str, emit: &mut dyn FnMut(String)) -> String {
        self.session.process_command_stream(text, emit)
    }

    pub fn ingest_document(
        &self,
        content: &str,
        source_doc: &str,
        memory_type: MemoryKind,
    ) -> Result<usize> {
        let ids = self
            .rag
            .ingest_document(content, source_doc, memory_type, serde_json::json!({}))?;
        Ok(ids.len())
    }

    /// Flush storage and reject further operations.
    pub fn shutdown(&self) -> Result<()> {
        self.memory.shutdown()?;
        Ok(())
    }
}
