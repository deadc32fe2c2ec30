#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use bookshop_api::{
    app_router,
    config::AppConfig,
    db,
    entities::{book, order, order_line, payment, shipping_method, PaymentMethod},
    errors::ServiceError,
    events::{self, EventSender},
    handlers::ServiceDeps,
    money::Money,
    notifications::{Mailer, NotificationError, OrderEmail, SmsGateway},
    services::{
        checkout::CheckoutForm,
        order_numbers::{OrderNumberGenerator, TimestampSequenceGenerator},
        payments::{
            MobileMoney, PaymentProvider, PaymentProviders, PaymentRequest, ProviderCallback,
            ProviderOutcome, CashOnDelivery,
        },
    },
    AppState,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, EntityTrait, PaginatorTrait, Set};
use serde_json::Value;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

/// Mailer that remembers every email it was asked to send.
#[derive(Default)]
pub struct RecordingMailer {
    pub sent: Mutex<Vec<OrderEmail>>,
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send_order_email(&self, email: &OrderEmail) -> Result<(), NotificationError> {
        self.sent.lock().unwrap().push(email.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSms {
    pub sent: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl SmsGateway for RecordingSms {
    async fn send_sms(&self, phone: &str, message: &str) -> Result<(), NotificationError> {
        self.sent
            .lock()
            .unwrap()
            .push((phone.to_string(), message.to_string()));
        Ok(())
    }
}

pub struct FailingMailer;

#[async_trait]
impl Mailer for FailingMailer {
    async fn send_order_email(&self, _email: &OrderEmail) -> Result<(), NotificationError> {
        Err(NotificationError::Email("smtp relay refused connection".into()))
    }
}

pub struct FailingSms;

#[async_trait]
impl SmsGateway for FailingSms {
    async fn send_sms(&self, _phone: &str, _message: &str) -> Result<(), NotificationError> {
        Err(NotificationError::SmsRejected(503))
    }
}

/// Mobile money provider that counts how often it is initiated.
#[derive(Default)]
pub struct CountingMobileMoney {
    pub initiated: AtomicUsize,
}

impl CountingMobileMoney {
    pub fn calls(&self) -> usize {
        self.initiated.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentProvider for CountingMobileMoney {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::MobileMoney
    }

    fn name(&self) -> &str {
        "mtn-voda-at"
    }

    async fn initiate(&self, request: &PaymentRequest) -> Result<ProviderOutcome, ServiceError> {
        self.initiated.fetch_add(1, Ordering::SeqCst);
        MobileMoney.initiate(request).await
    }

    async fn reconcile(
        &self,
        order_number: &str,
        callback: &ProviderCallback,
    ) -> Result<ProviderOutcome, ServiceError> {
        MobileMoney.reconcile(order_number, callback).await
    }

    async fn cancel(&self, order_number: &str, reference: Option<&str>) -> Result<(), ServiceError> {
        MobileMoney.cancel(order_number, reference).await
    }
}

/// Provider that never answers within any reasonable timeout.
pub struct StalledMobileMoney;

#[async_trait]
impl PaymentProvider for StalledMobileMoney {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::MobileMoney
    }

    fn name(&self) -> &str {
        "stalled"
    }

    async fn initiate(&self, _request: &PaymentRequest) -> Result<ProviderOutcome, ServiceError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Err(ServiceError::InternalError("unreachable".into()))
    }

    async fn reconcile(
        &self,
        order_number: &str,
        callback: &ProviderCallback,
    ) -> Result<ProviderOutcome, ServiceError> {
        MobileMoney.reconcile(order_number, callback).await
    }

    async fn cancel(&self, _order_number: &str, _reference: Option<&str>) -> Result<(), ServiceError> {
        Ok(())
    }
}

/// Hands out a fixed list of numbers, then falls back to the real generator.
pub struct ScriptedOrderNumbers {
    script: Mutex<Vec<String>>,
    fallback: TimestampSequenceGenerator,
}

impl ScriptedOrderNumbers {
    pub fn new(numbers: &[&str]) -> Self {
        let mut script: Vec<String> = numbers.iter().map(|n| n.to_string()).collect();
        script.reverse();
        Self {
            script: Mutex::new(script),
            fallback: TimestampSequenceGenerator::new("TB"),
        }
    }
}

impl OrderNumberGenerator for ScriptedOrderNumbers {
    fn next_number(&self) -> String {
        self.script
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| self.fallback.next_number())
    }
}

/// Knobs for building a `TestApp`.
pub struct TestAppBuilder {
    mailer: Arc<dyn Mailer>,
    sms: Arc<dyn SmsGateway>,
    mobile_money: Arc<dyn PaymentProvider>,
    order_numbers: Arc<dyn OrderNumberGenerator>,
    provider_timeout: Duration,
    max_attempts: u32,
}

impl Default for TestAppBuilder {
    fn default() -> Self {
        Self {
            mailer: Arc::new(RecordingMailer::default()),
            sms: Arc::new(RecordingSms::default()),
            mobile_money: Arc::new(MobileMoney),
            order_numbers: Arc::new(TimestampSequenceGenerator::new("TB")),
            provider_timeout: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

impl TestAppBuilder {
    pub fn mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = mailer;
        self
    }

    pub fn sms(mut self, sms: Arc<dyn SmsGateway>) -> Self {
        self.sms = sms;
        self
    }

    pub fn mobile_money(mut self, provider: Arc<dyn PaymentProvider>) -> Self {
        self.mobile_money = provider;
        self
    }

    pub fn order_numbers(mut self, generator: Arc<dyn OrderNumberGenerator>) -> Self {
        self.order_numbers = generator;
        self
    }

    pub fn provider_timeout(mut self, timeout: Duration) -> Self {
        self.provider_timeout = timeout;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub async fn build(self) -> TestApp {
        let mut cfg = AppConfig::new("sqlite::memory:".to_string(), "test".to_string());
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.order_number_max_attempts = self.max_attempts;

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let (event_tx, event_rx) = mpsc::channel(256);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let deps = ServiceDeps {
            mailer: self.mailer,
            sms: self.sms,
            providers: PaymentProviders::new(Arc::new(CashOnDelivery), self.mobile_money),
            order_numbers: self.order_numbers,
            provider_timeout: self.provider_timeout,
        };

        let state = Arc::new(AppState::new(
            Arc::new(pool),
            cfg,
            EventSender::new(event_tx),
            deps,
        ));
        TestApp {
            router: app_router(state.clone()),
            state,
            _event_task: event_task,
        }
    }
}

/// Application backed by a fresh in-memory SQLite database.
pub struct TestApp {
    router: Router,
    pub state: Arc<AppState>,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        TestAppBuilder::default().build().await
    }

    pub fn builder() -> TestAppBuilder {
        TestAppBuilder::default()
    }

    pub async fn seed_book(&self, title: &str, price: Decimal, stock: i32) -> book::Model {
        let now = Utc::now();
        book::ActiveModel {
            id: Set(Uuid::new_v4()),
            title: Set(title.to_string()),
            isbn: Set(Uuid::new_v4().simple().to_string()[..13].to_string()),
            price_minor: Set(Money::try_from_decimal(price).unwrap().minor()),
            stock: Set(stock),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("failed to seed book")
    }

    pub async fn deactivate_book(&self, id: Uuid) {
        book::ActiveModel {
            id: Set(id),
            is_active: Set(false),
            ..Default::default()
        }
        .update(&*self.state.db)
        .await
        .expect("failed to deactivate book");
    }

    pub async fn seed_shipping(&self, name: &str, fee: Decimal) -> shipping_method::Model {
        shipping_method::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            slug: Set(name.to_lowercase().replace(' ', "-")),
            fee_minor: Set(Money::try_from_decimal(fee).unwrap().minor()),
            eta_days_min: Set(1),
            eta_days_max: Set(3),
            is_active: Set(true),
        }
        .insert(&*self.state.db)
        .await
        .expect("failed to seed shipping method")
    }

    pub async fn stock_of(&self, id: Uuid) -> i32 {
        book::Entity::find_by_id(id)
            .one(&*self.state.db)
            .await
            .unwrap()
            .expect("book exists")
            .stock
    }

    pub async fn order_count(&self) -> u64 {
        order::Entity::find().count(&*self.state.db).await.unwrap()
    }

    pub async fn order_line_count(&self) -> u64 {
        order_line::Entity::find().count(&*self.state.db).await.unwrap()
    }

    pub async fn payment_count(&self) -> u64 {
        payment::Entity::find().count(&*self.state.db).await.unwrap()
    }

    /// Sends a JSON request, attaching the cart session header when given.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        session: Option<&str>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(session) = session {
            builder = builder.header("x-session-id", session);
        }

        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }
}

pub async fn response_json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("failed to read body");
    serde_json::from_slice(&bytes).expect("body is not JSON")
}

pub fn checkout_form(shipping_method_id: Uuid, payment_method: PaymentMethod) -> CheckoutForm {
    CheckoutForm {
        shipping_method_id,
        full_name: "Ama Mensah".into(),
        email: "ama@example.com".into(),
        phone: "0240000000".into(),
        address_line1: "1 Oxford Street".into(),
        address_line2: None,
        city: "Accra".into(),
        region: "Greater Accra".into(),
        notes: None,
        payment_method,
        customer_id: None,
    }
}

/// Lets spawned notification tasks run to completion.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
}
