use banana_contracts::history::{BatchProgress, GeneratedImage, History};
use banana_contracts::GenerateError;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::generator::Generator;

/// Caller-facing state around a [`Generator`]: the image history and the
/// message of the most recent failure.
pub struct Session {
    generator: Generator,
    history: History,
    last_error: Option<String>,
}

impl Session {
    pub fn new(generator: Generator) -> Self {
        Self {
            generator,
            history: History::new(),
            last_error: None,
        }
    }

    pub fn generator(&self) -> &Generator {
        &self.generator
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn progress(&self) -> watch::Receiver<BatchProgress> {
        self.generator.progress()
    }

    pub async fn generate(
        &mut self,
        prompt: &str,
        input_image: Option<&[u8]>,
    ) -> Result<&GeneratedImage, GenerateError> {
        self.last_error = None;
        let bytes = self
            .generator
            .generate(prompt, input_image)
            .await
            .map_err(|err| self.fail(err))?;
        let id = self.history.push(GeneratedImage::new(
            bytes,
            prompt,
            input_image.map(<[u8]>::to_vec),
        ));
        self.history.get(id).ok_or(GenerateError::NoImageGenerated)
    }

    /// Pushes every produced image under the prompt that made it. Returns the
    /// ids in prompt order.
    pub async fn batch_generate(
        &mut self,
        prompts: &[String],
        input_images: &[Option<Vec<u8>>],
        cancel: &CancellationToken,
    ) -> Result<Vec<Uuid>, GenerateError> {
        self.last_error = None;
        let produced = self
            .generator
            .batch_generate(prompts, input_images, cancel)
            .await
            .map_err(|err| self.fail(err))?;
        let mut ids = Vec::with_capacity(produced.len());
        for item in produced {
            let source = input_images.get(item.index).cloned().flatten();
            ids.push(self.history.push(GeneratedImage::new(
                item.image,
                prompts[item.index].as_str(),
                source,
            )));
        }
        Ok(ids)
    }

    /// Pushes the initial image and every edit step; each edit records the
    /// image it was derived from. Nothing is pushed if any step fails.
    pub async fn iterative_edit(
        &mut self,
        initial_prompt: &str,
        edit_prompts: &[String],
        input_image: Option<&[u8]>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Uuid>, GenerateError> {
        self.last_error = None;
        let images = self
            .generator
            .iterative_edit(initial_prompt, edit_prompts, input_image, cancel)
            .await
            .map_err(|err| self.fail(err))?;

        let mut ids = Vec::with_capacity(images.len());
        let mut source = input_image.map(<[u8]>::to_vec);
        for (step, image) in images.into_iter().enumerate() {
            let prompt = match step {
                0 => initial_prompt.to_string(),
                n => format!("Edit: {}", edit_prompts[n - 1]),
            };
            let next_source = Some(image.clone());
            ids.push(self.history.push(GeneratedImage::new(image, prompt, source)));
            source = next_source;
        }
        Ok(ids)
    }

    pub fn delete(&mut self, id: Uuid) -> Option<GeneratedImage> {
        self.history.remove(id)
    }

    pub fn clear_cache(&self) {
        self.generator.cache().clear();
    }

    pub fn cache_size(&self) -> u64 {
        self.generator.cache().size()
    }

    pub fn cache_size_label(&self) -> String {
        format_byte_count(self.cache_size())
    }

    fn fail(&mut self, err: GenerateError) -> GenerateError {
        self.last_error = Some(err.user_message());
        err
    }
}

/// Decimal file-size label: "Zero KB", whole kilobytes, or megabytes with one
/// decimal place.
pub fn format_byte_count(bytes: u64) -> String {
    const KB: f64 = 1_000.0;
    const MB: f64 = 1_000_000.0;
    if bytes == 0 {
        return "Zero KB".to_string();
    }
    let value = bytes as f64;
    if value < MB {
        let kb = (value / KB).round().max(1.0);
        return format!("{kb:.0} KB");
    }
    let label = format!("{:.1}", value / MB);
    let label = label.strip_suffix(".0").unwrap_or(&label);
    format!("{label} MB")
}
