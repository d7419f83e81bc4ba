//! Training hooks run after every optimizer step.

use std::time::Instant;

use layoutcrf_core::models::{LayoutModel, TextDnnModel, TextRnnModel};
use layoutcrf_core::vocab::{Vocab, reserved};
use tracing::info;

/// What a hook sees after one step.
pub struct StepContext<'a, M: LayoutModel> {
    pub step: usize,
    pub loss: f32,
    pub model: &'a M,
    pub examples: &'a [M::Example],
    pub batch: &'a M::Batch,
}

pub trait TrainHook<M: LayoutModel> {
    fn after_step(&mut self, ctx: &StepContext<'_, M>) -> anyhow::Result<()>;
}

/// Logs the step, loss, learning rate and throughput every `every_n` steps.
pub struct LoggingHook {
    every_n: usize,
    learning_rate: f64,
    since: Instant,
    since_step: usize,
}

impl LoggingHook {
    pub fn new(every_n: usize, learning_rate: f64) -> Self {
        Self {
            every_n: every_n.max(1),
            learning_rate,
            since: Instant::now(),
            since_step: 0,
        }
    }
}

impl<M: LayoutModel> TrainHook<M> for LoggingHook {
    fn after_step(&mut self, ctx: &StepContext<'_, M>) -> anyhow::Result<()> {
        if ctx.step % self.every_n != 0 {
            return Ok(());
        }
        let elapsed = self.since.elapsed().as_secs_f64();
        let steps = ctx.step.saturating_sub(self.since_step);
        let steps_per_sec = if elapsed > 0.0 { steps as f64 / elapsed } else { 0.0 };
        info!(
            step = ctx.step,
            loss = ctx.loss,
            learning_rate = self.learning_rate,
            steps_per_sec,
            "training"
        );
        self.since = Instant::now();
        self.since_step = ctx.step;
        Ok(())
    }
}

/// Prints the first window of the batch as text with its target and the
/// predicted class.
pub struct TextVerboseHook {
    every_n: usize,
    vocab: Vocab,
}

impl TextVerboseHook {
    pub fn new(every_n: usize, vocab: Vocab) -> Self {
        Self {
            every_n: every_n.max(1),
            vocab,
        }
    }

    /// Window ids as text, padding removed.
    pub fn render(&self, ids: &[u32]) -> String {
        self.vocab.ids_to_string(ids, reserved::CORPUS_PAD)
    }
}

impl TrainHook<TextRnnModel> for TextVerboseHook {
    fn after_step(&mut self, ctx: &StepContext<'_, TextRnnModel>) -> anyhow::Result<()> {
        if ctx.step % self.every_n != 0 {
            return Ok(());
        }
        let Some(window) = ctx.examples.first() else {
            return Ok(());
        };
        let predicted = ctx.model.predict(ctx.batch)?;
        let pred = predicted.first().map(|p| p.class);
        info!(
            step = ctx.step,
            input = %self.render(&window.ids),
            target = window.label,
            ?pred,
            "text sample"
        );
        Ok(())
    }
}

/// Prints the first line pair with its token tags and the decoded ones.
pub struct TextDnnVerboseHook {
    every_n: usize,
    vocab: Vocab,
}

impl TextDnnVerboseHook {
    pub fn new(every_n: usize, vocab: Vocab) -> Self {
        Self {
            every_n: every_n.max(1),
            vocab,
        }
    }
}

impl TrainHook<TextDnnModel> for TextDnnVerboseHook {
    fn after_step(&mut self, ctx: &StepContext<'_, TextDnnModel>) -> anyhow::Result<()> {
        if ctx.step % self.every_n != 0 {
            return Ok(());
        }
        let Some(record) = ctx.examples.first() else {
            return Ok(());
        };
        let text = self
            .vocab
            .ids_to_string(&record.token_ids(&self.vocab), reserved::TEXT_DNN_PAD);
        let predicted = ctx.model.predict(ctx.batch)?;
        let pred_tags = predicted.first().map(|p| p.crf_tags.clone()).unwrap_or_default();
        info!(
            step = ctx.step,
            total_text_ids = %text,
            tags = ?record.tags,
            pred_tags = ?pred_tags,
            "text-dnn sample"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use layoutcrf_core::vocab::{EOL_TOKEN, EOS_TOKEN, PAD_TOKEN, UNK_TOKEN};

    #[test]
    fn render_drops_padding() {
        let vocab = Vocab::from_tokens([UNK_TOKEN, PAD_TOKEN, EOS_TOKEN, EOL_TOKEN, "本", "期"]);
        let hook = TextVerboseHook::new(10, vocab);
        assert_eq!(hook.render(&[4, 3, 5, 1, 1]), "本<EOL>期");
    }

    #[test]
    fn zero_interval_is_clamped() {
        let hook = LoggingHook::new(0, 0.001);
        assert_eq!(hook.every_n, 1);
    }
}
