//! Shared UI icons with plain-text fallbacks.

use console::Emoji;

// Status indicators
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "[SKIP]");
pub static STOP: Emoji<'_, '_> = Emoji("⏹️  ", "[STOP]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");

// Progress indicators
pub static TARGET: Emoji<'_, '_> = Emoji("🎯 ", "[T]");
pub static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>]");
pub static RETRY: Emoji<'_, '_> = Emoji("🔄 ", "[RETRY]");
pub static CLOCK: Emoji<'_, '_> = Emoji("⏱️  ", "[T]");
