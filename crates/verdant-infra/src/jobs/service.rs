//! Job queue service - the single entry point for submitting, querying,
//! cancelling and monitoring background jobs.
//!
//! Constructed once at startup and shared behind an `Arc`. Until
//! [`JobQueueService::initialize`] has run, every call is served inline.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{OnceCell, broadcast};

use verdant_core::domain::{
    ExecutionMode, Job, JobData, JobEvent, JobOptions, JobStatusReport, JobType, QueueStats,
};
use verdant_core::ports::{BrokerConnector, BrokerError, JobBroker};
use verdant_core::{JobQueueError, ProcessorRegistry};

use super::executor::{BrokerBackedExecutor, InlineExecutor, JobExecutor};

pub struct JobQueueService {
    registry: ProcessorRegistry,
    connector: Arc<dyn BrokerConnector>,
    inline: Arc<InlineExecutor>,
    executor: OnceCell<Arc<dyn JobExecutor>>,
}

impl JobQueueService {
    pub fn new(registry: ProcessorRegistry, connector: Arc<dyn BrokerConnector>) -> Self {
        Self {
            inline: Arc::new(InlineExecutor::new(registry.clone())),
            registry,
            connector,
            executor: OnceCell::new(),
        }
    }

    /// Connect one broker per job type and start its workers.
    ///
    /// Idempotent. Never fails: if any broker cannot be reached the
    /// service switches to inline execution for every job type.
    pub async fn initialize(&self) -> ExecutionMode {
        self.executor
            .get_or_init(|| self.select_executor())
            .await
            .mode()
    }

    /// Strategy currently servicing requests.
    pub fn mode(&self) -> ExecutionMode {
        self.executor().mode()
    }

    pub fn is_initialized(&self) -> bool {
        self.executor.initialized()
    }

    fn executor(&self) -> Arc<dyn JobExecutor> {
        match self.executor.get() {
            Some(executor) => executor.clone(),
            None => self.inline.clone(),
        }
    }

    async fn select_executor(&self) -> Arc<dyn JobExecutor> {
        match self.connect_all().await {
            Ok(brokers) => {
                for broker in brokers.values() {
                    tokio::spawn(log_events(broker.job_type(), broker.subscribe()));
                }
                tracing::info!(queues = brokers.len(), "Job queue initialized with broker");
                Arc::new(BrokerBackedExecutor::new(brokers))
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "Job broker unavailable, running jobs inline"
                );
                self.inline.clone()
            }
        }
    }

    async fn connect_all(&self) -> Result<HashMap<JobType, Arc<dyn JobBroker>>, BrokerError> {
        let mut brokers: HashMap<JobType, Arc<dyn JobBroker>> = HashMap::new();

        for job_type in JobType::ALL {
            match self.open_queue(job_type).await {
                Ok(broker) => {
                    brokers.insert(job_type, broker);
                }
                Err(e) => {
                    for opened in brokers.values() {
                        if let Err(close_err) = opened.close().await {
                            tracing::warn!(error = %close_err, "Failed to close broker after connect failure");
                        }
                    }
                    return Err(e);
                }
            }
        }

        Ok(brokers)
    }

    async fn open_queue(&self, job_type: JobType) -> Result<Arc<dyn JobBroker>, BrokerError> {
        let broker = self.connector.connect(job_type).await?;

        match self.registry.get(job_type) {
            Some(processor) => {
                if let Err(e) = broker.start_workers(processor).await {
                    if let Err(close_err) = broker.close().await {
                        tracing::warn!(
                            job_type = %job_type,
                            error = %close_err,
                            "Failed to close broker after worker start failure"
                        );
                    }
                    return Err(e);
                }
            }
            None => {
                tracing::warn!(job_type = %job_type, "No processor registered, queue has no workers");
            }
        }

        Ok(broker)
    }

    /// Submit a job and return its id.
    ///
    /// With a broker this returns as soon as the job is enqueued. Inline,
    /// it returns after the processor has finished; either way the outcome
    /// is read through [`JobQueueService::get_job_status`].
    pub async fn add_job(
        &self,
        data: JobData,
        options: Option<JobOptions>,
    ) -> Result<String, JobQueueError> {
        if data.user_id.trim().is_empty() {
            return Err(JobQueueError::Validation("userId is required".to_string()));
        }

        let job_type = data.job_type();
        if !self.registry.contains(job_type) {
            return Err(JobQueueError::NoProcessor(job_type));
        }

        let job = Job::new(data, options.unwrap_or_default());
        let job_id = job.id.clone();

        match self.executor().submit(job.clone()).await {
            Ok(()) => {}
            Err(JobQueueError::Broker(e)) => {
                tracing::warn!(
                    job_id = %job_id,
                    job_type = %job_type,
                    error = %e,
                    "Enqueue failed, running job inline"
                );
                self.inline.submit(job).await?;
            }
            Err(e) => return Err(e),
        }

        tracing::info!(job_id = %job_id, job_type = %job_type, "Job submitted");
        Ok(job_id)
    }

    /// Look a job up. Query failures are reported as an `error` status
    /// unless the job ran inline.
    pub async fn get_job_status(&self, job_type: JobType, job_id: &str) -> JobStatusReport {
        let query_error = match self.executor().find(job_type, job_id).await {
            Ok(Some(job)) => return job.into(),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(job_id = %job_id, job_type = %job_type, error = %e, "Status query failed");
                Some(e)
            }
        };

        // Runs that fell back to inline after a failed enqueue live here.
        if let Ok(Some(job)) = self.inline.find(job_type, job_id).await {
            return job.into();
        }

        match query_error {
            Some(e) => JobStatusReport::error(e.to_string()),
            None => JobStatusReport::not_found(),
        }
    }

    /// Remove a job that has not finished. Best effort: any failure,
    /// including a job a worker is running, yields `false`.
    pub async fn cancel_job(&self, job_type: JobType, job_id: &str) -> bool {
        match self.executor().cancel(job_type, job_id).await {
            Ok(cancelled) => {
                if cancelled {
                    tracing::info!(job_id = %job_id, job_type = %job_type, "Job cancelled");
                }
                cancelled
            }
            Err(BrokerError::JobLocked(_)) => {
                tracing::debug!(job_id = %job_id, job_type = %job_type, "Job is running, not cancelled");
                false
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, job_type = %job_type, error = %e, "Cancel failed");
                false
            }
        }
    }

    /// Bucket counts for every job type. A failing queue reports zeros
    /// without affecting the others.
    pub async fn get_queue_stats(&self) -> BTreeMap<JobType, QueueStats> {
        let executor = self.executor();
        let queries = JobType::ALL.map(|job_type| {
            let executor = executor.clone();
            async move { (job_type, executor.stats(job_type).await) }
        });

        join_all(queries)
            .await
            .into_iter()
            .map(|(job_type, result)| {
                let stats = result.unwrap_or_else(|e| {
                    tracing::warn!(job_type = %job_type, error = %e, "Stats query failed");
                    QueueStats::default()
                });
                (job_type, stats)
            })
            .collect()
    }

    /// Lifecycle events for one job type. `None` when running inline.
    pub fn subscribe(&self, job_type: JobType) -> Option<broadcast::Receiver<JobEvent>> {
        self.executor().subscribe(job_type)
    }

    /// Close every broker. Always completes; close errors are logged.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down job queue");
        self.executor().shutdown().await;
    }
}

async fn log_events(job_type: JobType, mut events: broadcast::Receiver<JobEvent>) {
    loop {
        match events.recv().await {
            Ok(JobEvent::Completed { job_id, .. }) => {
                tracing::info!(job_type = %job_type, job_id = %job_id, "Job completed");
            }
            Ok(JobEvent::Failed { job_id, error, .. }) => {
                tracing::error!(job_type = %job_type, job_id = %job_id, error = %error, "Job failed");
            }
            Ok(event) => {
                tracing::trace!(job_type = %job_type, job_id = %event.job_id(), "Job event");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(job_type = %job_type, skipped = skipped, "Job event log lagging");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use verdant_core::domain::{
        DataExtractionPayload, JobOutput, JobPayload, JobStatus, LcaCalculationPayload,
        LcaOptions, PdfGenerationPayload, ReportData, ReportExportPayload,
    };
    use verdant_core::ports::{JobProcessor, ProcessorError, ProgressReporter};

    use crate::config::BrokerConfig;
    use crate::jobs::InMemoryConnector;

    // -- Test processors ------------------------------------------------

    struct Fixed(JobOutput);

    #[async_trait]
    impl JobProcessor for Fixed {
        async fn process(
            &self,
            _job: &Job,
            progress: &dyn ProgressReporter,
        ) -> Result<JobOutput, ProcessorError> {
            progress.report(10).await;
            Ok(self.0.clone())
        }
    }

    struct FailsTimes {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl JobProcessor for FailsTimes {
        async fn process(
            &self,
            _job: &Job,
            _progress: &dyn ProgressReporter,
        ) -> Result<JobOutput, ProcessorError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err(ProcessorError::retryable(format!("transient failure {call}")))
            } else {
                Ok(JobOutput::json(serde_json::json!({ "call": call })))
            }
        }
    }

    fn full_registry() -> ProcessorRegistry {
        ProcessorRegistry::new()
            .register(
                JobType::PdfGeneration,
                Fixed(JobOutput::binary("application/pdf", b"%PDF-1.4".to_vec())),
            )
            .register(
                JobType::LcaCalculation,
                Fixed(JobOutput::json(serde_json::json!({ "totalCarbonFootprint": 42.0 }))),
            )
            .register(
                JobType::DataExtraction,
                Fixed(JobOutput::json(serde_json::json!({ "success": true }))),
            )
            .register(
                JobType::ReportExport,
                Fixed(JobOutput::binary("text/csv", b"a,b\n".to_vec())),
            )
    }

    fn payload_for(job_type: JobType) -> JobPayload {
        match job_type {
            JobType::PdfGeneration => JobPayload::PdfGeneration(PdfGenerationPayload {
                report_data: ReportData {
                    id: "rep-1".to_string(),
                    title: "Quarterly footprint".to_string(),
                    content: "Scope 1 and 2".to_string(),
                },
                format: "A4".to_string(),
                options: serde_json::Value::Null,
            }),
            JobType::LcaCalculation => JobPayload::LcaCalculation(LcaCalculationPayload {
                product_id: "prod-1".to_string(),
                calculation_method: "ISO14040".to_string(),
                options: LcaOptions::default(),
            }),
            JobType::DataExtraction => JobPayload::DataExtraction(DataExtractionPayload {
                extraction_type: "company_info".to_string(),
                source_url: "https://example.com".to_string(),
                target_fields: vec!["email".to_string()],
            }),
            JobType::ReportExport => JobPayload::ReportExport(ReportExportPayload {
                report_id: "rep-1".to_string(),
                export_format: "csv".to_string(),
                options: serde_json::Value::Null,
            }),
        }
    }

    // -- Scripted broker ------------------------------------------------

    /// Holds each job until released.
    struct Gate {
        started: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl JobProcessor for Gate {
        async fn process(
            &self,
            _job: &Job,
            _progress: &dyn ProgressReporter,
        ) -> Result<JobOutput, ProcessorError> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(JobOutput::json(serde_json::json!({ "released": true })))
        }
    }

    #[derive(Default)]
    struct Behavior {
        fail_add: bool,
        fail_get: bool,
        fail_remove: bool,
        fail_counts: bool,
        fail_close: bool,
        fail_start: bool,
        stored: Option<Job>,
    }

    #[derive(Default)]
    struct Calls {
        add: Vec<String>,
        remove: Vec<String>,
        close: u32,
    }

    struct ScriptedBroker {
        job_type: JobType,
        behavior: Behavior,
        calls: StdMutex<Calls>,
        events: broadcast::Sender<JobEvent>,
    }

    impl ScriptedBroker {
        fn new(job_type: JobType, behavior: Behavior) -> Arc<Self> {
            let (events, _) = broadcast::channel(16);
            Arc::new(Self {
                job_type,
                behavior,
                calls: StdMutex::new(Calls::default()),
                events,
            })
        }
    }

    #[async_trait]
    impl JobBroker for ScriptedBroker {
        fn job_type(&self) -> JobType {
            self.job_type
        }

        async fn add(&self, job: Job) -> Result<(), BrokerError> {
            self.calls.lock().unwrap().add.push(job.job_type().to_string());
            if self.behavior.fail_add {
                return Err(BrokerError::Command("connection refused".to_string()));
            }
            Ok(())
        }

        async fn get_job(&self, job_id: &str) -> Result<Option<Job>, BrokerError> {
            if self.behavior.fail_get {
                return Err(BrokerError::Command("connection reset by peer".to_string()));
            }
            Ok(self.behavior.stored.clone().filter(|job| job.id == job_id))
        }

        async fn remove(&self, job_id: &str) -> Result<bool, BrokerError> {
            self.calls.lock().unwrap().remove.push(job_id.to_string());
            if self.behavior.fail_remove {
                return Err(BrokerError::Command("READONLY replica".to_string()));
            }
            Ok(true)
        }

        async fn counts(&self) -> Result<QueueStats, BrokerError> {
            if self.behavior.fail_counts {
                return Err(BrokerError::Command("timeout".to_string()));
            }
            Ok(QueueStats {
                waiting: 3,
                active: 1,
                completed: 5,
                failed: 0,
                delayed: 2,
            })
        }

        async fn start_workers(
            &self,
            _processor: Arc<dyn JobProcessor>,
        ) -> Result<(), BrokerError> {
            if self.behavior.fail_start {
                return Err(BrokerError::Command("NOSCRIPT".to_string()));
            }
            Ok(())
        }

        fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
            self.events.subscribe()
        }

        async fn close(&self) -> Result<(), BrokerError> {
            self.calls.lock().unwrap().close += 1;
            if self.behavior.fail_close {
                return Err(BrokerError::Connection("already closed".to_string()));
            }
            Ok(())
        }
    }

    #[derive(Clone)]
    struct ScriptedConnector {
        brokers: HashMap<JobType, Arc<ScriptedBroker>>,
        connects: Arc<AtomicU32>,
        refuse: Option<JobType>,
    }

    impl ScriptedConnector {
        fn healthy() -> Self {
            Self::with(|_| Behavior::default())
        }

        fn with(behavior: impl Fn(JobType) -> Behavior) -> Self {
            let brokers = JobType::ALL
                .into_iter()
                .map(|job_type| (job_type, ScriptedBroker::new(job_type, behavior(job_type))))
                .collect();
            Self {
                brokers,
                connects: Arc::new(AtomicU32::new(0)),
                refuse: None,
            }
        }

        /// Healthy for every job type except one.
        fn refusing(job_type: JobType) -> Self {
            Self {
                refuse: Some(job_type),
                ..Self::healthy()
            }
        }

        fn calls(&self, job_type: JobType) -> std::sync::MutexGuard<'_, Calls> {
            self.brokers[&job_type].calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl BrokerConnector for ScriptedConnector {
        async fn connect(&self, job_type: JobType) -> Result<Arc<dyn JobBroker>, BrokerError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.refuse == Some(job_type) {
                return Err(BrokerError::Connection("Connection refused (os error 111)".to_string()));
            }
            let broker: Arc<dyn JobBroker> = self.brokers[&job_type].clone();
            Ok(broker)
        }
    }

    struct Unreachable;

    #[async_trait]
    impl BrokerConnector for Unreachable {
        async fn connect(&self, _job_type: JobType) -> Result<Arc<dyn JobBroker>, BrokerError> {
            Err(BrokerError::Connection("Connection refused (os error 111)".to_string()))
        }
    }

    async fn scripted_service(connector: ScriptedConnector) -> (JobQueueService, ScriptedConnector) {
        let service = JobQueueService::new(full_registry(), Arc::new(connector.clone()));
        assert_eq!(service.initialize().await, ExecutionMode::Broker);
        (service, connector)
    }

    fn memory_service(registry: ProcessorRegistry) -> JobQueueService {
        let config = BrokerConfig {
            workers_per_queue: 1,
            poll_interval: Duration::from_millis(10),
            backoff_base: Duration::from_millis(5),
            ..BrokerConfig::default()
        };
        JobQueueService::new(registry, Arc::new(InMemoryConnector::new(config)))
    }

    async fn wait_for_status(
        service: &JobQueueService,
        job_type: JobType,
        job_id: &str,
        status: JobStatus,
    ) -> JobStatusReport {
        for _ in 0..300 {
            let report = service.get_job_status(job_type, job_id).await;
            if report.status == status {
                return report;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} never reached {status}");
    }

    // -- Submission -----------------------------------------------------

    #[tokio::test]
    async fn test_add_job_enqueues_once_per_type() {
        let (service, connector) = scripted_service(ScriptedConnector::healthy()).await;

        for job_type in JobType::ALL {
            let id = service
                .add_job(JobData::new("user-1", payload_for(job_type)), None)
                .await
                .unwrap();
            assert!(id.starts_with(&format!("{}_", job_type.as_str())));
        }

        for job_type in JobType::ALL {
            let calls = connector.calls(job_type);
            assert_eq!(calls.add, vec![job_type.as_str().to_string()]);
        }
    }

    #[tokio::test]
    async fn test_add_job_keeps_supplied_id() {
        let (service, _) = scripted_service(ScriptedConnector::healthy()).await;

        let data = JobData::new("user-1", payload_for(JobType::ReportExport)).with_job_id("export-77");
        let id = service.add_job(data, None).await.unwrap();

        assert_eq!(id, "export-77");
    }

    #[tokio::test]
    async fn test_add_job_validates_input() {
        let service = JobQueueService::new(
            ProcessorRegistry::new().register(
                JobType::PdfGeneration,
                Fixed(JobOutput::binary("application/pdf", b"%PDF".to_vec())),
            ),
            Arc::new(Unreachable),
        );

        let err = service
            .add_job(JobData::new("  ", payload_for(JobType::PdfGeneration)), None)
            .await
            .unwrap_err();
        assert!(matches!(err, JobQueueError::Validation(_)));

        let err = service
            .add_job(JobData::new("user-1", payload_for(JobType::DataExtraction)), None)
            .await
            .unwrap_err();
        assert!(matches!(err, JobQueueError::NoProcessor(JobType::DataExtraction)));
    }

    #[tokio::test]
    async fn test_unreachable_broker_runs_inline() {
        let service = JobQueueService::new(full_registry(), Arc::new(Unreachable));
        assert_eq!(service.initialize().await, ExecutionMode::Inline);

        for job_type in JobType::ALL {
            let id = service
                .add_job(JobData::new("user-1", payload_for(job_type)), None)
                .await
                .unwrap();
            let report = service.get_job_status(job_type, &id).await;
            assert_eq!(report.status, JobStatus::Completed);
            assert_eq!(report.attempts_made, 1);
        }
    }

    #[tokio::test]
    async fn test_partial_connect_failure_closes_opened_brokers() {
        let connector = ScriptedConnector::refusing(JobType::DataExtraction);
        let service = JobQueueService::new(full_registry(), Arc::new(connector.clone()));

        assert_eq!(service.initialize().await, ExecutionMode::Inline);

        assert_eq!(connector.calls(JobType::PdfGeneration).close, 1);
        assert_eq!(connector.calls(JobType::LcaCalculation).close, 1);
        assert_eq!(connector.calls(JobType::DataExtraction).close, 0);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 3);

        let id = service
            .add_job(JobData::new("user-1", payload_for(JobType::PdfGeneration)), None)
            .await
            .unwrap();
        assert!(connector.calls(JobType::PdfGeneration).add.is_empty());
        assert_eq!(
            service.get_job_status(JobType::PdfGeneration, &id).await.status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_worker_start_failure_closes_broker_even_if_close_fails() {
        let connector = ScriptedConnector::with(|job_type| Behavior {
            fail_start: job_type == JobType::LcaCalculation,
            fail_close: job_type == JobType::LcaCalculation,
            ..Behavior::default()
        });
        let service = JobQueueService::new(full_registry(), Arc::new(connector.clone()));

        assert_eq!(service.initialize().await, ExecutionMode::Inline);

        assert_eq!(connector.calls(JobType::PdfGeneration).close, 1);
        assert_eq!(connector.calls(JobType::LcaCalculation).close, 1);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_enqueue_failure_runs_job_inline() {
        let (service, connector) = scripted_service(ScriptedConnector::with(|_| Behavior {
            fail_add: true,
            ..Behavior::default()
        }))
        .await;

        let id = service
            .add_job(JobData::new("user-1", payload_for(JobType::LcaCalculation)), None)
            .await
            .unwrap();

        assert_eq!(connector.calls(JobType::LcaCalculation).add.len(), 1);
        assert_eq!(service.mode(), ExecutionMode::Broker);
        let report = service.get_job_status(JobType::LcaCalculation, &id).await;
        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.attempts_made, 1);
    }

    #[tokio::test]
    async fn test_inline_outcome_readable_while_broker_down() {
        let (service, _) = scripted_service(ScriptedConnector::with(|_| Behavior {
            fail_add: true,
            fail_get: true,
            ..Behavior::default()
        }))
        .await;

        let id = service
            .add_job(JobData::new("user-1", payload_for(JobType::LcaCalculation)), None)
            .await
            .unwrap();

        let report = service.get_job_status(JobType::LcaCalculation, &id).await;
        assert_eq!(report.status, JobStatus::Completed);
        let result = report.result.unwrap();
        assert!(result.as_json().unwrap().get("totalCarbonFootprint").is_some());

        // Unknown ids still surface the query failure.
        let missing = service.get_job_status(JobType::LcaCalculation, "other").await;
        assert_eq!(missing.status, JobStatus::Error);
    }

    #[tokio::test]
    async fn test_calls_before_initialize_run_inline() {
        let connector = ScriptedConnector::healthy();
        let service = JobQueueService::new(full_registry(), Arc::new(connector.clone()));

        assert!(!service.is_initialized());
        let id = service
            .add_job(JobData::new("user-1", payload_for(JobType::ReportExport)), None)
            .await
            .unwrap();

        assert_eq!(service.mode(), ExecutionMode::Inline);
        assert_eq!(
            service.get_job_status(JobType::ReportExport, &id).await.status,
            JobStatus::Completed
        );
        assert!(connector.calls(JobType::ReportExport).add.is_empty());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let (service, connector) = scripted_service(ScriptedConnector::healthy()).await;
        let first = service.executor();

        assert_eq!(service.initialize().await, ExecutionMode::Broker);
        assert!(Arc::ptr_eq(&first, &service.executor()));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 4);
    }

    // -- Status ---------------------------------------------------------

    #[tokio::test]
    async fn test_status_not_found() {
        let (service, _) = scripted_service(ScriptedConnector::healthy()).await;

        let report = service.get_job_status(JobType::LcaCalculation, "missing").await;

        assert_eq!(report, JobStatusReport::not_found());
        assert_eq!(report.progress, 0);
    }

    #[tokio::test]
    async fn test_status_reports_query_error() {
        let (service, _) = scripted_service(ScriptedConnector::with(|_| Behavior {
            fail_get: true,
            ..Behavior::default()
        }))
        .await;

        let report = service.get_job_status(JobType::PdfGeneration, "pdf-1").await;

        assert_eq!(report.status, JobStatus::Error);
        assert!(report.error.unwrap().contains("connection reset by peer"));
    }

    // -- Cancellation ---------------------------------------------------

    fn queued_job(job_type: JobType, id: &str) -> Job {
        Job::new(
            JobData::new("user-1", payload_for(job_type)).with_job_id(id),
            JobOptions::default(),
        )
    }

    #[tokio::test]
    async fn test_cancel_found_job_removes_it() {
        let (service, connector) = scripted_service(ScriptedConnector::with(|job_type| Behavior {
            stored: Some(queued_job(job_type, "job-1")),
            ..Behavior::default()
        }))
        .await;

        assert!(service.cancel_job(JobType::DataExtraction, "job-1").await);
        assert_eq!(
            connector.calls(JobType::DataExtraction).remove,
            vec!["job-1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_cancel_missing_job_returns_false() {
        let (service, connector) = scripted_service(ScriptedConnector::healthy()).await;

        assert!(!service.cancel_job(JobType::DataExtraction, "nope").await);
        assert!(connector.calls(JobType::DataExtraction).remove.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_finished_job_returns_false() {
        let mut finished = queued_job(JobType::ReportExport, "done-1");
        finished.activate();
        finished.complete(JobOutput::json(serde_json::json!({})));

        let (service, _) = scripted_service(ScriptedConnector::with(move |_| Behavior {
            stored: Some(finished.clone()),
            ..Behavior::default()
        }))
        .await;

        assert!(!service.cancel_job(JobType::ReportExport, "done-1").await);
    }

    #[tokio::test]
    async fn test_cancel_swallows_broker_errors() {
        let (service, _) = scripted_service(ScriptedConnector::with(|job_type| Behavior {
            stored: Some(queued_job(job_type, "job-2")),
            fail_remove: true,
            ..Behavior::default()
        }))
        .await;

        assert!(!service.cancel_job(JobType::LcaCalculation, "job-2").await);
    }

    #[tokio::test]
    async fn test_cancel_active_job_leaves_it_running() {
        let gate = Arc::new(Gate {
            started: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
        });
        let registry = ProcessorRegistry::new().register_shared(JobType::ReportExport, gate.clone());
        let service = memory_service(registry);
        service.initialize().await;

        let id = service
            .add_job(JobData::new("user-1", payload_for(JobType::ReportExport)), None)
            .await
            .unwrap();
        gate.started.notified().await;

        assert!(!service.cancel_job(JobType::ReportExport, &id).await);
        assert_eq!(
            service.get_job_status(JobType::ReportExport, &id).await.status,
            JobStatus::Active
        );

        gate.release.notify_one();
        let report = wait_for_status(&service, JobType::ReportExport, &id, JobStatus::Completed).await;
        assert_eq!(report.attempts_made, 1);

        service.shutdown().await;
    }

    // -- Stats ----------------------------------------------------------

    #[tokio::test]
    async fn test_stats_isolate_failing_type() {
        let (service, _) = scripted_service(ScriptedConnector::with(|job_type| Behavior {
            fail_counts: job_type == JobType::LcaCalculation,
            ..Behavior::default()
        }))
        .await;

        let stats = service.get_queue_stats().await;

        assert_eq!(stats.len(), 4);
        assert_eq!(stats[&JobType::LcaCalculation], QueueStats::default());
        assert_eq!(stats[&JobType::PdfGeneration].waiting, 3);
        assert_eq!(stats[&JobType::ReportExport].delayed, 2);
    }

    // -- Shutdown -------------------------------------------------------

    #[tokio::test]
    async fn test_shutdown_completes_when_close_fails() {
        let (service, connector) = scripted_service(ScriptedConnector::with(|_| Behavior {
            fail_close: true,
            ..Behavior::default()
        }))
        .await;

        service.shutdown().await;

        for broker in connector.brokers.values() {
            assert_eq!(broker.calls.lock().unwrap().close, 1);
        }
    }

    // -- End to end -----------------------------------------------------

    #[tokio::test]
    async fn test_pdf_job_runs_through_broker() {
        let service = memory_service(full_registry());
        assert_eq!(service.initialize().await, ExecutionMode::Broker);

        let mut events = service.subscribe(JobType::PdfGeneration).unwrap();
        let id = service
            .add_job(
                JobData::new("user-1", payload_for(JobType::PdfGeneration)),
                Some(JobOptions::default().with_delay_ms(100)),
            )
            .await
            .unwrap();

        assert_eq!(
            service.get_job_status(JobType::PdfGeneration, &id).await.status,
            JobStatus::Queued
        );

        let report = wait_for_status(&service, JobType::PdfGeneration, &id, JobStatus::Completed).await;
        let bytes = report.result.unwrap().as_bytes().unwrap().to_vec();
        assert!(!bytes.is_empty());
        assert_eq!(report.progress, 100);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                JobEvent::Active { .. } => seen.push("active"),
                JobEvent::Completed { .. } => seen.push("completed"),
                _ => {}
            }
        }
        assert_eq!(seen, vec!["active", "completed"]);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_lca_job_inline_when_broker_unavailable() {
        let service = JobQueueService::new(full_registry(), Arc::new(Unreachable));
        service.initialize().await;

        let id = service
            .add_job(JobData::new("user-1", payload_for(JobType::LcaCalculation)), None)
            .await
            .unwrap();

        let report = service.get_job_status(JobType::LcaCalculation, &id).await;
        let result = report.result.unwrap();
        assert!(result.as_json().unwrap().get("totalCarbonFootprint").is_some());
        assert!(service.subscribe(JobType::LcaCalculation).is_none());
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let registry = ProcessorRegistry::new().register(
            JobType::DataExtraction,
            FailsTimes {
                failures: 2,
                calls: AtomicU32::new(0),
            },
        );
        let service = memory_service(registry);
        service.initialize().await;

        let id = service
            .add_job(
                JobData::new("user-1", payload_for(JobType::DataExtraction)),
                Some(JobOptions::default().with_attempts(3)),
            )
            .await
            .unwrap();

        let report = wait_for_status(&service, JobType::DataExtraction, &id, JobStatus::Completed).await;
        assert_eq!(report.attempts_made, 3);
        assert!(report.error.is_none());

        service.shutdown().await;
    }
}
