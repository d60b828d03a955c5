use anyhow::{bail, Context, Result};
use std::path::Path;
use tch::{Kind, Tensor};

/// Decodes an image file into a [3, height, width] float tensor in [0, 1].
/// Grayscale images are repeated over three channels, alpha is dropped.
pub fn load_image(path: &Path, (height, width): (i64, i64)) -> Result<Tensor> {
    let image = tch::vision::image::load(path).with_context(|| format!("Failed to decode image {:?}", path))?;
    let image = match image.size()[0] {
        1 => image.repeat([3, 1, 1]),
        3 => image,
        4 => image.narrow(0, 0, 3).contiguous(),
        channels => bail!("Unsupported channel count {} in {:?}", channels, path),
    };
    let image = tch::vision::image::resize(&image, width, height)
        .with_context(|| format!("Failed to resize image {:?}", path))?;
    Ok(image.to_kind(Kind::Float) / 255.0)
}
