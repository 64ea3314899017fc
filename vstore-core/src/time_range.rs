/*!
Normalisation de la fenêtre temporelle

L'opérateur saisit les bornes en heure locale (`2024-01-01T12:30:00`); le
device attend de l'UTC dans son propre format (`2024-01-01_11-30-00Z`).
La conversion est une fonction pure du texte et du fuseau, et une saisie
invalide donne une chaîne vide plutôt qu'une erreur.
*/

use chrono::{DateTime, Local, LocalResult, NaiveDateTime, Offset, TimeDelta, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Format des horodatages dans les commandes device.
pub const WIRE_FORMAT: &str = "%Y-%m-%d_%H-%M-%SZ";

/// Format des sélecteurs d'heure locale (à la seconde).
pub const LOCAL_INPUT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

// les champs datetime-local omettent les secondes nulles
const LOCAL_INPUT_FORMAT_MINUTES: &str = "%Y-%m-%dT%H:%M";

/// Durée de la fenêtre à l'ouverture du panneau.
pub const DEFAULT_WINDOW_SECS: i64 = 60;

/// Bornes saisies par l'opérateur, gardées telles qu'affichées.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub from_local: String,
    pub to_local: String,
}

impl TimeWindow {
    pub fn new(from_local: impl Into<String>, to_local: impl Into<String>) -> Self {
        Self {
            from_local: from_local.into(),
            to_local: to_local.into(),
        }
    }
}

/// Convertit le texte local vers le format device pour un fuseau donné.
#[derive(Debug, Clone)]
pub struct TimeRangeCodec<Tz: TimeZone = Local> {
    zone: Tz,
}

impl TimeRangeCodec<Local> {
    /// Codec pour le fuseau de la machine qui fait tourner le panneau.
    pub fn local() -> Self {
        Self { zone: Local }
    }
}

impl Default for TimeRangeCodec<Local> {
    fn default() -> Self {
        Self::local()
    }
}

impl<Tz> TimeRangeCodec<Tz>
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    pub fn new(zone: Tz) -> Self {
        Self { zone }
    }

    /// Texte local `YYYY-MM-DDTHH:MM:SS` -> `YYYY-MM-DD_HH-MM-SSZ`, ou `""`.
    pub fn to_wire_format(&self, local_text: &str) -> String {
        self.parse_local(local_text)
            .map(|instant| format_wire(&instant))
            .unwrap_or_default()
    }

    /// Résout le texte local en instant UTC.
    ///
    /// `None` pour un texte illisible. Une heure répétée (recul d'heure) donne
    /// le premier instant. Une heure sautée (passage à l'heure d'été) est lue
    /// avec le décalage en vigueur juste avant la transition : 02:30 à
    /// New York le 10 mars 2024 donne 07:30Z.
    pub fn parse_local(&self, local_text: &str) -> Option<DateTime<Utc>> {
        let text = local_text.trim();
        if text.is_empty() {
            return None;
        }
        let naive = NaiveDateTime::parse_from_str(text, LOCAL_INPUT_FORMAT)
            .or_else(|_| NaiveDateTime::parse_from_str(text, LOCAL_INPUT_FORMAT_MINUTES))
            .ok()?;
        match self.zone.from_local_datetime(&naive) {
            LocalResult::Single(instant) | LocalResult::Ambiguous(instant, _) => {
                Some(instant.with_timezone(&Utc))
            }
            LocalResult::None => self.resolve_gap(&naive),
        }
    }

    fn resolve_gap(&self, naive: &NaiveDateTime) -> Option<DateTime<Utc>> {
        let before = naive.checked_sub_signed(TimeDelta::days(1))?;
        let offset = self.zone.offset_from_local_datetime(&before).earliest()?.fix();
        let shift = TimeDelta::seconds(i64::from(offset.local_minus_utc()));
        Some(naive.checked_sub_signed(shift)?.and_utc())
    }

    /// Affiche un instant comme le font les sélecteurs locaux.
    pub fn render_local(&self, instant: DateTime<Utc>) -> String {
        instant
            .with_timezone(&self.zone)
            .format(LOCAL_INPUT_FORMAT)
            .to_string()
    }

    /// Fenêtre affichée à l'ouverture : la dernière minute jusqu'à `now`.
    pub fn default_window(&self, now: DateTime<Utc>) -> TimeWindow {
        TimeWindow {
            from_local: self.render_local(now - TimeDelta::seconds(DEFAULT_WINDOW_SECS)),
            to_local: self.render_local(now),
        }
    }

    /// Valeurs device des deux bornes; chacune peut être vide.
    pub fn wire_range(&self, window: &TimeWindow) -> (String, String) {
        (
            self.to_wire_format(&window.from_local),
            self.to_wire_format(&window.to_local),
        )
    }
}

pub fn format_wire(instant: &DateTime<Utc>) -> String {
    instant.format(WIRE_FORMAT).to_string()
}

/// Relit une valeur device en instant UTC.
pub fn parse_wire(wire: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(wire, WIRE_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}
