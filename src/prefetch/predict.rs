//! Static prediction rules: which queries are likely needed after a signal.

use crate::resources::QuerySpec;

/// Navigation or interaction observed in the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
  OpenedDashboard,
  OpenedPropertyList,
  /// Pointer resting on a property row
  HoveredProperty { property_id: String },
  OpenedProperty { property_id: String },
  OpenedBookingList { property_id: Option<String> },
  OpenedBooking {
    booking_id: String,
    guest_id: Option<String>,
  },
  OpenedGuest { guest_id: String },
  OpenedInvoiceList,
  OpenedExpenseList,
  OpenedVendorList,
  OpenedCalendar { property_id: String },
}

/// A query predicted to be needed soon.
#[derive(Debug, Clone, PartialEq)]
pub struct PrefetchCandidate {
  pub spec: QuerySpec,
  /// Likelihood in `0.0..=1.0` that the query is read next
  pub confidence: f32,
  pub signal: Signal,
}

/// Candidates for `signal`, most likely first.
pub fn predict(signal: &Signal) -> Vec<PrefetchCandidate> {
  let rules: Vec<(QuerySpec, f32)> = match signal {
    Signal::OpenedDashboard => vec![
      (QuerySpec::bookings(None), 0.9),
      (QuerySpec::properties(), 0.9),
      (QuerySpec::invoices(), 0.6),
      (QuerySpec::reports_summary(), 0.5),
    ],
    Signal::OpenedPropertyList => vec![
      (QuerySpec::bookings(None), 0.7),
      (QuerySpec::dashboard_stats(), 0.4),
    ],
    Signal::HoveredProperty { property_id } => vec![
      (QuerySpec::property(property_id), 0.9),
      (QuerySpec::bookings(Some(property_id)), 0.7),
      (QuerySpec::media(property_id), 0.6),
    ],
    Signal::OpenedProperty { property_id } => vec![
      (QuerySpec::bookings(Some(property_id)), 0.9),
      (QuerySpec::calendar(property_id), 0.85),
      (QuerySpec::media(property_id), 0.8),
      (QuerySpec::documents(), 0.4),
    ],
    Signal::OpenedBookingList { property_id } => {
      let mut rules = vec![(QuerySpec::guests(), 0.6)];
      if let Some(property_id) = property_id {
        rules.insert(0, (QuerySpec::calendar(property_id), 0.7));
      }
      rules
    }
    Signal::OpenedBooking { guest_id, .. } => {
      let mut rules = vec![(QuerySpec::invoices(), 0.6)];
      if let Some(guest_id) = guest_id {
        rules.insert(0, (QuerySpec::guest(guest_id), 0.9));
      }
      rules
    }
    Signal::OpenedGuest { .. } => vec![(QuerySpec::bookings(None), 0.5)],
    Signal::OpenedInvoiceList => vec![
      (QuerySpec::expenses(), 0.7),
      (QuerySpec::reports_summary(), 0.5),
    ],
    Signal::OpenedExpenseList => vec![
      (QuerySpec::vendors(), 0.85),
      (QuerySpec::invoices(), 0.6),
    ],
    Signal::OpenedVendorList => vec![(QuerySpec::expenses(), 0.6)],
    Signal::OpenedCalendar { property_id } => vec![
      (QuerySpec::bookings(Some(property_id)), 0.9),
      (QuerySpec::property(property_id), 0.7),
    ],
  };

  rules
    .into_iter()
    .map(|(spec, confidence)| PrefetchCandidate {
      spec,
      confidence,
      signal: signal.clone(),
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::query_key;

  #[test]
  fn test_prediction_is_deterministic() {
    let signal = Signal::OpenedProperty {
      property_id: "p1".to_string(),
    };
    assert_eq!(predict(&signal), predict(&signal));
  }

  #[test]
  fn test_booking_predicts_guest_first() {
    let signal = Signal::OpenedBooking {
      booking_id: "b1".to_string(),
      guest_id: Some("g7".to_string()),
    };
    let candidates = predict(&signal);
    assert_eq!(candidates[0].spec.key, query_key!["guest", "g7"]);
    assert_eq!(candidates[0].signal, signal);

    let without_guest = predict(&Signal::OpenedBooking {
      booking_id: "b1".to_string(),
      guest_id: None,
    });
    assert_eq!(without_guest.len(), 1);
  }

  #[test]
  fn test_candidates_are_ordered_and_bounded() {
    let signals = [
      Signal::OpenedDashboard,
      Signal::OpenedPropertyList,
      Signal::HoveredProperty {
        property_id: "p1".to_string(),
      },
      Signal::OpenedBookingList {
        property_id: Some("p1".to_string()),
      },
      Signal::OpenedInvoiceList,
      Signal::OpenedExpenseList,
      Signal::OpenedVendorList,
      Signal::OpenedCalendar {
        property_id: "p1".to_string(),
      },
    ];
    for signal in signals {
      let candidates = predict(&signal);
      assert!(!candidates.is_empty(), "{:?}", signal);
      for pair in candidates.windows(2) {
        assert!(pair[0].confidence >= pair[1].confidence, "{:?}", signal);
      }
      assert!(candidates
        .iter()
        .all(|c| (0.0..=1.0).contains(&c.confidence)));
    }
  }
}
