use std::fmt::Write;

use super::availability::first_available_slot;
use super::snapshot::EngineSnapshot;
use crate::model::*;
use crate::time::{day_name, format_clock, weekday_name};

pub const FULLY_BOOKED: &str = "LOTADO";
pub const CLOSED: &str = "FECHADO";

/// Plain-text summary of a snapshot for the conversational layer.
pub fn render(snapshot: &EngineSnapshot) -> String {
    let mut out = String::new();
    let _ = write_context(&mut out, snapshot);
    out
}

fn write_context(out: &mut String, snapshot: &EngineSnapshot) -> std::fmt::Result {
    let now = snapshot.built_local;
    let today = now.date();
    let products = snapshot.config.duration_mode.products();

    writeln!(out, "=== AGENDA ===")?;
    writeln!(out, "HOJE: {} {}", day_name(today), today)?;
    writeln!(out, "HORA ACTUAL: {}", now.format("%H:%M"))?;
    writeln!(out, "DURAÇÃO: {} minutos", snapshot.default_duration())?;

    if !products.is_empty() {
        writeln!(out, "SERVIÇOS:")?;
        for p in products {
            match p.price {
                Some(price) => writeln!(out, "• {} ({} min) - {price}€", p.name, p.duration)?,
                None => writeln!(out, "• {} ({} min)", p.name, p.duration)?,
            }
        }
    }

    if snapshot.occupied.values().any(|r| !r.is_empty()) {
        writeln!(out, "OCUPADO:")?;
        for (date, ranges) in &snapshot.occupied {
            if ranges.is_empty() {
                continue;
            }
            let blocks: Vec<String> = ranges
                .iter()
                .map(|r| format!("{} {}", r.span, r.label))
                .collect();
            writeln!(out, "• {} ({date}): {}", day_name(*date), blocks.join(", "))?;
        }
    }

    writeln!(out, "DISPONIBILIDADE:")?;
    for (date, day) in &snapshot.precomputed {
        let label = format!("{} ({date})", day_name(*date));
        let (open, close) = match day.hours {
            DayHours::Closed => {
                writeln!(out, "• {label}: {CLOSED}")?;
                continue;
            }
            DayHours::Open { open, close } => (open, close),
        };
        if day.is_fully_booked() {
            writeln!(out, "• {label}: {FULLY_BOOKED}")?;
            continue;
        }
        let hours = format!("[{}-{}]", format_clock(open), format_clock(close));
        if products.is_empty() {
            let windows: Vec<String> = day.free_windows().iter().map(|w| w.to_string()).collect();
            writeln!(out, "• {label} {hours}: livre {}", windows.join(", "))?;
        } else {
            writeln!(out, "• {label} {hours}:")?;
            let view = snapshot.day(*date, now);
            for p in products {
                match first_available_slot(&view, p.duration) {
                    Some(start) => writeln!(out, "  → {}: {}", p.name, format_clock(start))?,
                    None => writeln!(out, "  → {}: {FULLY_BOOKED}", p.name)?,
                }
            }
        }
    }

    let closed: Vec<&str> = (0..7u8)
        .filter(|d| !snapshot.config.working_days.contains(d))
        .map(weekday_name)
        .collect();
    if !closed.is_empty() {
        writeln!(out, "DIAS FECHADOS: {}", closed.join(", "))?;
    }

    if let FeedStatus::Degraded(reason) = &snapshot.feed_status {
        writeln!(
            out,
            "AVISO: calendário externo indisponível ({reason}); apenas marcações locais."
        )?;
    }
    Ok(())
}
