mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use bookshop_api::{
    entities::{book, order, payment, OrderStatus, PaymentMethod, PaymentStatus},
    errors::ServiceError,
    services::{cart::CartState, checkout::NextStep},
};
use common::{
    checkout_form, settle, CountingMobileMoney, FailingMailer, FailingSms, RecordingMailer,
    RecordingSms, ScriptedOrderNumbers, TestApp,
};
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};

async fn fill_cart(app: &TestApp, cart: &mut CartState, book_id: uuid::Uuid, copies: u32) {
    for _ in 0..copies {
        app.state.services.cart.add(cart, book_id).await.unwrap();
    }
}

#[tokio::test]
async fn totals_are_computed_from_cart_and_shipping() {
    let app = TestApp::new().await;
    let novel = app.seed_book("Americanah", dec!(50.00), 10).await;
    let poems = app.seed_book("Poems", dec!(30.00), 10).await;
    let shipping = app.seed_shipping("Standard", dec!(10.00)).await;

    let mut cart = CartState::new();
    fill_cart(&app, &mut cart, novel.id, 2).await;
    fill_cart(&app, &mut cart, poems.id, 1).await;

    let outcome = app
        .state
        .services
        .checkout
        .place_order(&mut cart, checkout_form(shipping.id, PaymentMethod::MobileMoney))
        .await
        .unwrap();

    assert_eq!(outcome.order.subtotal(), dec!(130.00));
    assert_eq!(outcome.order.shipping_fee(), dec!(10.00));
    assert_eq!(outcome.order.total(), dec!(140.00));
    assert_eq!(outcome.order.status, OrderStatus::New);
    assert_eq!(outcome.payment.amount_minor, 14000);
    assert_eq!(outcome.lines.len(), 2);

    let novel_line = outcome
        .lines
        .iter()
        .find(|l| l.book_id == novel.id)
        .unwrap();
    assert_eq!(novel_line.title_snapshot, "Americanah");
    assert_eq!(novel_line.unit_price_minor, 5000);
    assert_eq!(novel_line.quantity, 2);
    assert_eq!(novel_line.line_total_minor, 10000);
    assert!(outcome
        .lines
        .iter()
        .all(|l| l.order_number == outcome.order.order_number));

    assert_eq!(app.stock_of(novel.id).await, 8);
    assert_eq!(app.stock_of(poems.id).await, 9);
}

#[tokio::test]
async fn cash_on_delivery_is_authorized_without_mobile_money() {
    let mailer = Arc::new(RecordingMailer::default());
    let sms = Arc::new(RecordingSms::default());
    let momo = Arc::new(CountingMobileMoney::default());
    let app = TestApp::builder()
        .mailer(mailer.clone())
        .sms(sms.clone())
        .mobile_money(momo.clone())
        .build()
        .await;
    let book = app.seed_book("Ghana Must Go", dec!(25.00), 3).await;
    let shipping = app.seed_shipping("Pickup", dec!(0.00)).await;

    let mut cart = CartState::new();
    fill_cart(&app, &mut cart, book.id, 1).await;

    let outcome = app
        .state
        .services
        .checkout
        .place_order(&mut cart, checkout_form(shipping.id, PaymentMethod::CashOnDelivery))
        .await
        .unwrap();

    assert_eq!(outcome.payment.method, PaymentMethod::CashOnDelivery);
    assert_eq!(outcome.payment.status, PaymentStatus::Authorized);
    assert_eq!(outcome.payment.provider, "cod");
    assert_matches!(outcome.next, NextStep::Confirmation { ref order_number } if *order_number == outcome.order.order_number);
    assert!(cart.is_empty());
    assert_eq!(momo.calls(), 0);

    settle().await;
    let emails = mailer.sent.lock().unwrap().clone();
    assert_eq!(emails.len(), 1);
    assert_eq!(emails[0].to, "ama@example.com");
    assert!(emails[0]
        .subject
        .contains(&format!("#{}", outcome.order.order_number)));

    let texts = sms.sent.lock().unwrap().clone();
    assert_eq!(texts.len(), 1);
    assert_eq!(texts[0].0, "0240000000");
    assert!(texts[0].1.contains("Pay on delivery"));
}

#[tokio::test]
async fn mobile_money_order_stays_pending_until_started() {
    let momo = Arc::new(CountingMobileMoney::default());
    let app = TestApp::builder().mobile_money(momo.clone()).build().await;
    let book = app.seed_book("Homegoing", dec!(40.00), 2).await;
    let shipping = app.seed_shipping("Express", dec!(15.00)).await;

    let mut cart = CartState::new();
    fill_cart(&app, &mut cart, book.id, 1).await;

    let checkout = &app.state.services.checkout;
    let outcome = checkout
        .place_order(&mut cart, checkout_form(shipping.id, PaymentMethod::MobileMoney))
        .await
        .unwrap();
    let number = outcome.order.order_number.clone();

    assert_eq!(outcome.payment.status, PaymentStatus::Pending);
    assert_eq!(outcome.payment.provider_reference, None);
    assert_eq!(
        outcome.next,
        NextStep::StartMobileMoney {
            order_number: number.clone()
        }
    );
    assert_eq!(momo.calls(), 0);
    // still held until the payment completes
    assert_eq!(cart.quantity(&book.id), 1);

    let transition = checkout.start_payment(&number, &mut cart).await.unwrap();
    assert!(transition.changed);
    assert_eq!(transition.payment.status, PaymentStatus::Paid);
    assert_eq!(
        transition.payment.provider_reference,
        Some(format!("SIM-{}", number))
    );
    assert_eq!(transition.order.status, OrderStatus::Paid);
    assert!(cart.is_empty());
    assert_eq!(momo.calls(), 1);
}

#[tokio::test]
async fn failed_reservation_persists_nothing() {
    let app = TestApp::new().await;
    let plenty = app.seed_book("Plenty", dec!(10.00), 5).await;
    let scarce = app.seed_book("Scarce", dec!(12.00), 2).await;
    let shipping = app.seed_shipping("Standard", dec!(10.00)).await;

    let mut cart = CartState::new();
    fill_cart(&app, &mut cart, plenty.id, 2).await;
    fill_cart(&app, &mut cart, scarce.id, 2).await;

    // someone else buys one copy after it went into this cart
    app.state.services.inventory.reserve(scarce.id, 1).await.unwrap();
    let before = cart.clone();

    let err = app
        .state
        .services
        .checkout
        .place_order(&mut cart, checkout_form(shipping.id, PaymentMethod::CashOnDelivery))
        .await
        .unwrap_err();

    assert_matches!(
        err,
        ServiceError::InsufficientStock { ref title, requested: 2, available: 1 } if title == "Scarce"
    );
    assert_eq!(app.order_count().await, 0);
    assert_eq!(app.order_line_count().await, 0);
    assert_eq!(app.payment_count().await, 0);
    assert_eq!(app.stock_of(plenty.id).await, 5);
    assert_eq!(app.stock_of(scarce.id).await, 1);
    assert_eq!(cart, before);
}

#[tokio::test]
async fn empty_or_unresolvable_cart_is_rejected() {
    let app = TestApp::new().await;
    let shipping = app.seed_shipping("Standard", dec!(10.00)).await;
    let checkout = &app.state.services.checkout;

    let mut cart = CartState::new();
    assert_matches!(
        checkout
            .place_order(&mut cart, checkout_form(shipping.id, PaymentMethod::MobileMoney))
            .await,
        Err(ServiceError::EmptyCart)
    );

    let book = app.seed_book("Withdrawn", dec!(9.99), 4).await;
    fill_cart(&app, &mut cart, book.id, 1).await;
    app.deactivate_book(book.id).await;

    assert_matches!(
        checkout
            .place_order(&mut cart, checkout_form(shipping.id, PaymentMethod::MobileMoney))
            .await,
        Err(ServiceError::EmptyCart)
    );
    assert_eq!(app.order_count().await, 0);
}

#[tokio::test]
async fn unknown_shipping_method_is_a_validation_error() {
    let app = TestApp::new().await;
    let book = app.seed_book("Book", dec!(20.00), 4).await;
    let mut cart = CartState::new();
    fill_cart(&app, &mut cart, book.id, 1).await;

    let err = app
        .state
        .services
        .checkout
        .place_order(
            &mut cart,
            checkout_form(uuid::Uuid::new_v4(), PaymentMethod::MobileMoney),
        )
        .await
        .unwrap_err();

    assert_matches!(err, ServiceError::ValidationError(msg) if msg.contains("delivery option"));
    assert_eq!(cart.quantity(&book.id), 1);
}

#[tokio::test]
async fn blank_required_field_keeps_cart() {
    let app = TestApp::new().await;
    let book = app.seed_book("Book", dec!(20.00), 4).await;
    let shipping = app.seed_shipping("Standard", dec!(10.00)).await;
    let mut cart = CartState::new();
    fill_cart(&app, &mut cart, book.id, 1).await;

    let mut form = checkout_form(shipping.id, PaymentMethod::CashOnDelivery);
    form.city = "   ".into();

    let err = app
        .state
        .services
        .checkout
        .place_order(&mut cart, form)
        .await
        .unwrap_err();

    assert_matches!(err, ServiceError::ValidationError(_));
    assert_eq!(cart.quantity(&book.id), 1);
    assert_eq!(app.order_count().await, 0);
    assert_eq!(app.stock_of(book.id).await, 4);
}

#[tokio::test]
async fn blank_optional_fields_are_stored_as_null() {
    let app = TestApp::new().await;
    let book = app.seed_book("Book", dec!(20.00), 4).await;
    let shipping = app.seed_shipping("Standard", dec!(10.00)).await;
    let mut cart = CartState::new();
    fill_cart(&app, &mut cart, book.id, 1).await;

    let mut form = checkout_form(shipping.id, PaymentMethod::CashOnDelivery);
    form.address_line2 = Some("  ".into());
    form.notes = Some(" call on arrival ".into());

    let outcome = app
        .state
        .services
        .checkout
        .place_order(&mut cart, form)
        .await
        .unwrap();

    let stored = order::Entity::find_by_id(outcome.order.id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.address_line2, None);
    assert_eq!(stored.notes.as_deref(), Some("call on arrival"));
}

#[tokio::test]
async fn colliding_order_number_is_retried() {
    let app = TestApp::builder()
        .order_numbers(Arc::new(ScriptedOrderNumbers::new(&["TB-DUP", "TB-DUP", "TB-FRESH"])))
        .build()
        .await;
    let book = app.seed_book("Book", dec!(20.00), 4).await;
    let shipping = app.seed_shipping("Standard", dec!(10.00)).await;
    let checkout = &app.state.services.checkout;

    let mut first = CartState::new();
    fill_cart(&app, &mut first, book.id, 1).await;
    let placed = checkout
        .place_order(&mut first, checkout_form(shipping.id, PaymentMethod::CashOnDelivery))
        .await
        .unwrap();
    assert_eq!(placed.order.order_number, "TB-DUP");

    let mut second = CartState::new();
    fill_cart(&app, &mut second, book.id, 1).await;
    let retried = checkout
        .place_order(&mut second, checkout_form(shipping.id, PaymentMethod::CashOnDelivery))
        .await
        .unwrap();
    assert_eq!(retried.order.order_number, "TB-FRESH");
    assert_eq!(app.order_count().await, 2);

    let payments = payment::Entity::find()
        .filter(payment::Column::OrderId.eq(retried.order.id))
        .all(&*app.state.db)
        .await
        .unwrap();
    assert_eq!(payments.len(), 1);
    assert_eq!(app.stock_of(book.id).await, 2);
}

#[tokio::test]
async fn exhausted_order_number_attempts_fail_cleanly() {
    let app = TestApp::builder()
        .order_numbers(Arc::new(ScriptedOrderNumbers::new(&[
            "TB-SAME", "TB-SAME", "TB-SAME", "TB-SAME",
        ])))
        .max_attempts(3)
        .build()
        .await;
    let book = app.seed_book("Book", dec!(20.00), 4).await;
    let shipping = app.seed_shipping("Standard", dec!(10.00)).await;
    let checkout = &app.state.services.checkout;

    let mut first = CartState::new();
    fill_cart(&app, &mut first, book.id, 1).await;
    checkout
        .place_order(&mut first, checkout_form(shipping.id, PaymentMethod::CashOnDelivery))
        .await
        .unwrap();

    let mut second = CartState::new();
    fill_cart(&app, &mut second, book.id, 1).await;
    let err = checkout
        .place_order(&mut second, checkout_form(shipping.id, PaymentMethod::CashOnDelivery))
        .await
        .unwrap_err();

    assert_matches!(err, ServiceError::OrderNumberCollision(3));
    assert_eq!(app.order_count().await, 1);
    assert_eq!(app.stock_of(book.id).await, 3);
    assert_eq!(second.quantity(&book.id), 1);
}

#[tokio::test]
async fn notification_failures_do_not_fail_checkout() {
    let app = TestApp::builder()
        .mailer(Arc::new(FailingMailer))
        .sms(Arc::new(FailingSms))
        .build()
        .await;
    let book = app.seed_book("Book", dec!(20.00), 4).await;
    let shipping = app.seed_shipping("Standard", dec!(10.00)).await;
    let mut cart = CartState::new();
    fill_cart(&app, &mut cart, book.id, 1).await;

    let outcome = app
        .state
        .services
        .checkout
        .place_order(&mut cart, checkout_form(shipping.id, PaymentMethod::CashOnDelivery))
        .await
        .unwrap();
    settle().await;

    assert_eq!(outcome.payment.status, PaymentStatus::Authorized);
    assert_eq!(app.order_count().await, 1);
    assert!(cart.is_empty());
}

#[tokio::test]
async fn summary_lists_shipping_by_fee_and_uses_cheapest_as_default() {
    let app = TestApp::new().await;
    let book = app.seed_book("Book", dec!(50.00), 4).await;
    app.seed_shipping("Express", dec!(25.00)).await;
    app.seed_shipping("Standard", dec!(10.00)).await;
    let mut cart = CartState::new();
    fill_cart(&app, &mut cart, book.id, 2).await;

    let summary = app.state.services.checkout.summary(&cart).await.unwrap();

    let names: Vec<_> = summary.shipping_methods.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["Standard", "Express"]);
    assert_eq!(summary.item_count, 2);
    assert_eq!(summary.subtotal, dec!(100.00));
    assert_eq!(summary.default_shipping_fee, dec!(10.00));
    assert_eq!(summary.subtotal_plus_shipping, dec!(110.00));
}

#[tokio::test]
async fn order_lines_keep_their_snapshot_when_the_book_changes() {
    let app = TestApp::new().await;
    let novel = app.seed_book("Things Fall Apart", dec!(50.00), 5).await;
    let shipping = app.seed_shipping("Standard", dec!(10.00)).await;
    let mut cart = CartState::new();
    fill_cart(&app, &mut cart, novel.id, 2).await;

    let placed = app
        .state
        .services
        .checkout
        .place_order(&mut cart, checkout_form(shipping.id, PaymentMethod::CashOnDelivery))
        .await
        .unwrap();

    book::ActiveModel {
        id: Set(novel.id),
        title: Set("Things Fall Apart (Anniversary Edition)".into()),
        price_minor: Set(7500),
        ..Default::default()
    }
    .update(&*app.state.db)
    .await
    .unwrap();

    let details = app
        .state
        .services
        .orders
        .find_by_number(&placed.order.order_number)
        .await
        .unwrap();

    assert_eq!(details.lines.len(), 1);
    let line = &details.lines[0];
    assert_eq!(line.title_snapshot, "Things Fall Apart");
    assert_eq!(line.unit_price_minor, 5000);
    assert_eq!(line.line_total_minor, 10000);
    assert_eq!(details.order.subtotal(), dec!(100.00));
    assert_eq!(details.order.total(), dec!(110.00));
}
