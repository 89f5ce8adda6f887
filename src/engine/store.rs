use std::collections::{BTreeMap, HashMap};

use ulid::Ulid;

use crate::model::*;

use super::error::GuardFailure;

/// The full table set. Only the engine's writer path mutates it, one batch at a time.
#[derive(Debug, Default)]
pub struct Tables {
    pub(super) shops: HashMap<String, Shop>,
    pub(super) locations: HashMap<(String, String), Location>,
    pub(super) products: HashMap<(String, i64), Product>,
    pub(super) inventory: BTreeMap<DayKey, InventoryDay>,
    pub(super) bookings: HashMap<Ulid, Booking>,
    pub(super) tokens: HashMap<String, Ulid>,
    pub(super) items: HashMap<Ulid, Vec<BookingItem>>,
    pub(super) days: HashMap<Ulid, Vec<BookingDay>>,
    pub(super) webhook_events: HashMap<(String, String), WebhookEvent>,
}

/// Prior state of one row, recorded before a statement touches it.
#[derive(Debug)]
pub(super) enum Undo {
    Shop(String, Option<Shop>),
    Location((String, String), Option<Location>),
    Product((String, i64), Option<Product>),
    Inventory(DayKey, Option<InventoryDay>),
    Booking(Ulid, Option<Booking>),
    Token(String, Option<Ulid>),
    PopItem(Ulid),
    PopDay(Ulid),
    WebhookEvent((String, String), Option<WebhookEvent>),
}

fn restore<K, V>(map: &mut HashMap<K, V>, key: K, prior: Option<V>)
where
    K: std::hash::Hash + Eq,
{
    match prior {
        Some(v) => {
            map.insert(key, v);
        }
        None => {
            map.remove(&key);
        }
    }
}

fn pop_row<T>(map: &mut HashMap<Ulid, Vec<T>>, id: Ulid) {
    if let Some(rows) = map.get_mut(&id) {
        rows.pop();
        if rows.is_empty() {
            map.remove(&id);
        }
    }
}

impl Tables {
    /// Apply one statement, pushing what it overwrote onto `undo`. A conditional
    /// statement that matches nothing returns the guard failure and leaves the
    /// tables untouched by this statement.
    pub(super) fn apply(&mut self, stmt: &Statement, undo: &mut Vec<Undo>) -> Result<(), GuardFailure> {
        match stmt {
            Statement::UpsertShop(shop) => {
                let prior = self.shops.insert(shop.domain.clone(), shop.clone());
                undo.push(Undo::Shop(shop.domain.clone(), prior));
            }
            Statement::UpsertLocation(loc) => {
                let key = (loc.shop.clone(), loc.code.clone());
                let prior = self.locations.insert(key.clone(), loc.clone());
                undo.push(Undo::Location(key, prior));
            }
            Statement::UpsertProduct(product) => {
                let key = (product.shop.clone(), product.product_id);
                let prior = self.products.insert(key.clone(), product.clone());
                undo.push(Undo::Product(key, prior));
            }
            Statement::SetDayCapacity { shop, product_id, date, capacity } => {
                let key = (shop.clone(), *product_id, *date);
                let prior = self.inventory.get(&key).cloned();
                if let Some(row) = &prior
                    && *capacity < row.reserved_qty
                {
                    return Err(GuardFailure::CapacityBelowReserved {
                        product_id: *product_id,
                        date: *date,
                        reserved: row.reserved_qty,
                    });
                }
                let reserved_qty = prior.as_ref().map_or(0, |row| row.reserved_qty);
                self.inventory.insert(
                    key.clone(),
                    InventoryDay {
                        shop: shop.clone(),
                        product_id: *product_id,
                        date: *date,
                        capacity: *capacity,
                        reserved_qty,
                    },
                );
                undo.push(Undo::Inventory(key, prior));
            }
            Statement::InsertBooking(booking) => {
                if self.bookings.contains_key(&booking.id) {
                    return Err(GuardFailure::DuplicateBooking(booking.id));
                }
                if self.tokens.contains_key(&booking.token) {
                    return Err(GuardFailure::DuplicateToken);
                }
                self.bookings.insert(booking.id, booking.clone());
                self.tokens.insert(booking.token.clone(), booking.id);
                undo.push(Undo::Booking(booking.id, None));
                undo.push(Undo::Token(booking.token.clone(), None));
            }
            Statement::InsertBookingItem(item) => {
                if !self.bookings.contains_key(&item.booking_id) {
                    return Err(GuardFailure::BookingMissing(item.booking_id));
                }
                self.items.entry(item.booking_id).or_default().push(item.clone());
                undo.push(Undo::PopItem(item.booking_id));
            }
            Statement::EnsureInventoryDay { shop, product_id, date, capacity } => {
                let key = (shop.clone(), *product_id, *date);
                if !self.inventory.contains_key(&key) {
                    self.inventory.insert(
                        key.clone(),
                        InventoryDay {
                            shop: shop.clone(),
                            product_id: *product_id,
                            date: *date,
                            capacity: *capacity,
                            reserved_qty: 0,
                        },
                    );
                    undo.push(Undo::Inventory(key, None));
                }
            }
            Statement::Reserve { shop, product_id, date, qty } => {
                let key = (shop.clone(), *product_id, *date);
                let exhausted = GuardFailure::CapacityExhausted { product_id: *product_id, date: *date };
                let Some(row) = self.inventory.get_mut(&key) else {
                    return Err(exhausted);
                };
                if row.reserved_qty + qty > row.capacity {
                    return Err(exhausted);
                }
                let prior = row.clone();
                row.reserved_qty += qty;
                undo.push(Undo::Inventory(key, Some(prior)));
            }
            Statement::Unreserve { shop, product_id, date, qty } => {
                let key = (shop.clone(), *product_id, *date);
                let underflow = GuardFailure::ReservedUnderflow { product_id: *product_id, date: *date };
                let Some(row) = self.inventory.get_mut(&key) else {
                    return Err(underflow);
                };
                if row.reserved_qty < *qty {
                    return Err(underflow);
                }
                let prior = row.clone();
                row.reserved_qty -= qty;
                undo.push(Undo::Inventory(key, Some(prior)));
            }
            Statement::InsertBookingDay(day) => {
                if !self.bookings.contains_key(&day.booking_id) {
                    return Err(GuardFailure::BookingMissing(day.booking_id));
                }
                self.days.entry(day.booking_id).or_default().push(day.clone());
                undo.push(Undo::PopDay(day.booking_id));
            }
            Statement::TransitionStatus { booking_id, from, to, reason, at } => {
                let booking = self.booking_in(*booking_id, from)?;
                let prior = booking.clone();
                booking.status = *to;
                booking.updated_at = *at;
                if reason.is_some() {
                    booking.invalid_reason = reason.clone();
                }
                undo.push(Undo::Booking(*booking_id, Some(prior)));
            }
            Statement::Confirm { booking_id, confirmation, at } => {
                let booking = self.booking_in(*booking_id, &[BookingStatus::Hold])?;
                let prior = booking.clone();
                booking.status = BookingStatus::Confirmed;
                booking.order_id = Some(confirmation.order_id);
                booking.customer_name = confirmation.customer_name.clone();
                booking.customer_email = confirmation.customer_email.clone();
                booking.revenue = confirmation.revenue;
                booking.fulfillment_type = confirmation.fulfillment_type.clone();
                booking.delivery_address = confirmation.delivery_address.clone();
                booking.updated_at = *at;
                undo.push(Undo::Booking(*booking_id, Some(prior)));
            }
            Statement::AppendNote { booking_id, note, at } => {
                let booking = self
                    .bookings
                    .get_mut(booking_id)
                    .ok_or(GuardFailure::BookingMissing(*booking_id))?;
                let prior = booking.clone();
                booking.notes = Some(match booking.notes.take() {
                    Some(existing) if !existing.is_empty() => format!("{existing}\n{note}"),
                    _ => note.clone(),
                });
                booking.updated_at = *at;
                undo.push(Undo::Booking(*booking_id, Some(prior)));
            }
            Statement::MarkFulfilled { booking_id, at } => {
                let booking = self.booking_in(*booking_id, &[BookingStatus::Confirmed])?;
                let prior = booking.clone();
                booking.fulfilled_at = Some(*at);
                booking.updated_at = *at;
                undo.push(Undo::Booking(*booking_id, Some(prior)));
            }
            Statement::InsertWebhookEvent(event) => {
                let key = (event.shop.clone(), event.event_id.clone());
                if self.webhook_events.contains_key(&key) {
                    return Err(GuardFailure::DuplicateWebhookEvent {
                        shop: event.shop.clone(),
                        event_id: event.event_id.clone(),
                    });
                }
                self.webhook_events.insert(key.clone(), event.clone());
                undo.push(Undo::WebhookEvent(key, None));
            }
            Statement::DeleteWebhookEvent { shop, event_id } => {
                let key = (shop.clone(), event_id.clone());
                if let Some(prior) = self.webhook_events.remove(&key) {
                    undo.push(Undo::WebhookEvent(key, Some(prior)));
                }
            }
        }
        Ok(())
    }

    fn booking_in(&mut self, id: Ulid, allowed: &[BookingStatus]) -> Result<&mut Booking, GuardFailure> {
        let booking = self
            .bookings
            .get_mut(&id)
            .ok_or(GuardFailure::BookingMissing(id))?;
        if !allowed.contains(&booking.status) {
            return Err(GuardFailure::StatusMismatch { booking_id: id, actual: booking.status });
        }
        Ok(booking)
    }

    /// Undo a partially applied batch, newest change first.
    pub(super) fn rollback(&mut self, undo: Vec<Undo>) {
        for entry in undo.into_iter().rev() {
            match entry {
                Undo::Shop(key, prior) => restore(&mut self.shops, key, prior),
                Undo::Location(key, prior) => restore(&mut self.locations, key, prior),
                Undo::Product(key, prior) => restore(&mut self.products, key, prior),
                Undo::Inventory(key, prior) => match prior {
                    Some(row) => {
                        self.inventory.insert(key, row);
                    }
                    None => {
                        self.inventory.remove(&key);
                    }
                },
                Undo::Booking(key, prior) => restore(&mut self.bookings, key, prior),
                Undo::Token(key, prior) => restore(&mut self.tokens, key, prior),
                Undo::PopItem(id) => pop_row(&mut self.items, id),
                Undo::PopDay(id) => pop_row(&mut self.days, id),
                Undo::WebhookEvent(key, prior) => restore(&mut self.webhook_events, key, prior),
            }
        }
    }

    /// Load a compaction snapshot row.
    pub(super) fn restore_row(&mut self, event: Event) {
        match event {
            Event::ShopRestored(shop) => {
                self.shops.insert(shop.domain.clone(), shop);
            }
            Event::LocationRestored(loc) => {
                self.locations.insert((loc.shop.clone(), loc.code.clone()), loc);
            }
            Event::ProductRestored(product) => {
                self.products.insert((product.shop.clone(), product.product_id), product);
            }
            Event::InventoryRestored(row) => {
                self.inventory.insert(row.key(), row);
            }
            Event::BookingRestored { booking, items, days } => {
                self.tokens.insert(booking.token.clone(), booking.id);
                if !items.is_empty() {
                    self.items.insert(booking.id, items);
                }
                if !days.is_empty() {
                    self.days.insert(booking.id, days);
                }
                self.bookings.insert(booking.id, booking);
            }
            Event::WebhookEventRestored(event) => {
                self.webhook_events
                    .insert((event.shop.clone(), event.event_id.clone()), event);
            }
            Event::BatchCommitted { .. } => {}
        }
    }

    /// The minimal event list that recreates the current tables.
    pub(super) fn snapshot(&self) -> Vec<Event> {
        let mut events = Vec::new();
        events.extend(self.shops.values().cloned().map(Event::ShopRestored));
        events.extend(self.locations.values().cloned().map(Event::LocationRestored));
        events.extend(self.products.values().cloned().map(Event::ProductRestored));
        events.extend(self.inventory.values().cloned().map(Event::InventoryRestored));
        for booking in self.bookings.values() {
            events.push(Event::BookingRestored {
                booking: booking.clone(),
                items: self.items.get(&booking.id).cloned().unwrap_or_default(),
                days: self.days.get(&booking.id).cloned().unwrap_or_default(),
            });
        }
        events.extend(self.webhook_events.values().cloned().map(Event::WebhookEventRestored));
        events
    }
}
