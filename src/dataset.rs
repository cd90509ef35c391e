use std::{
    fs,
    path::{Path, PathBuf},
};

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    tensor::{backend::Backend, Tensor, TensorData},
};
use image::imageops::FilterType;

use crate::{
    error::{YoloError, YoloResult},
    targets::{LabelBox, ScaleTarget, TargetBuilder},
};

/// One image with its labels and the target grids built from them.
#[derive(Clone, Debug)]
pub struct YoloItem {
    /// RGB pixels in `[0, 1]`, laid out as `[3, image_size, image_size]`.
    pub image: Vec<f32>,
    pub image_size: usize,
    /// One target grid per scale, coarsest first.
    pub targets: Vec<ScaleTarget>,
    pub boxes: Vec<LabelBox>,
}

impl YoloItem {
    /// Builds an item from already decoded pixels.
    pub fn new(
        image: Vec<f32>,
        image_size: usize,
        boxes: Vec<LabelBox>,
        targets: &TargetBuilder,
    ) -> Self {
        Self {
            image,
            image_size,
            targets: targets.build(&boxes),
            boxes,
        }
    }
}

#[derive(Clone, Debug)]
pub struct YoloBatch<B: Backend> {
    /// `[batch_size, 3, image_size, image_size]`
    pub images: Tensor<B, 4>,
    /// One `[batch_size, 3, S, S, 6]` tensor per scale.
    pub targets: Vec<Tensor<B, 5>>,
}

#[derive(Clone, Debug)]
pub struct YoloBatcher<B: Backend> {
    device: B::Device,
}

impl<B: Backend> YoloBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

impl<B: Backend> Batcher<YoloItem, YoloBatch<B>> for YoloBatcher<B> {
    fn batch(&self, items: Vec<YoloItem>) -> YoloBatch<B> {
        let images = items
            .iter()
            .map(|item| {
                let size = item.image_size;
                TensorData::new(item.image.clone(), [3, size, size])
            })
            .map(|data| Tensor::<B, 3>::from_data(data, &self.device))
            .collect();
        let images = Tensor::stack::<4>(images, 0);

        let num_scales = items.first().map(|item| item.targets.len()).unwrap_or(0);
        let targets = (0..num_scales)
            .map(|scale| {
                let grids = items
                    .iter()
                    .map(|item| {
                        let target = &item.targets[scale];
                        TensorData::new(target.values.clone(), target.shape())
                    })
                    .map(|data| Tensor::<B, 4>::from_data(data, &self.device))
                    .collect();
                Tensor::stack::<5>(grids, 0)
            })
            .collect();

        YoloBatch { images, targets }
    }
}

#[derive(Clone, Debug)]
struct Sample {
    image: PathBuf,
    boxes: Vec<LabelBox>,
}

/// Images listed in an index CSV, each paired with a label file.
///
/// Labels are parsed and every image is decoded once up front, so a bad sample fails the
/// build instead of cutting an epoch short. Images are decoded again on access.
#[derive(Clone, Debug)]
pub struct YoloDataset {
    samples: Vec<Sample>,
    image_size: usize,
    targets: TargetBuilder,
}

impl YoloDataset {
    /// Reads an index of `image,label` rows. The first row is a header.
    pub fn from_csv(
        index: impl AsRef<Path>,
        image_dir: impl AsRef<Path>,
        label_dir: impl AsRef<Path>,
        image_size: usize,
        num_classes: usize,
        targets: TargetBuilder,
    ) -> YoloResult<Self> {
        let index = index.as_ref();
        let csv_error = |source| YoloError::Csv {
            path: index.to_path_buf(),
            source,
        };
        let mut reader = csv::Reader::from_path(index).map_err(csv_error)?;

        let mut samples = Vec::new();
        for (row, record) in reader.records().enumerate() {
            let record = record.map_err(csv_error)?;
            let (Some(image), Some(label)) = (record.get(0), record.get(1)) else {
                return Err(YoloError::Label {
                    path: index.to_path_buf(),
                    line: row + 2,
                    msg: "expected an image and a label column".into(),
                });
            };

            let image = image_dir.as_ref().join(image.trim());
            if !image.is_file() {
                return Err(YoloError::io(
                    image,
                    std::io::Error::from(std::io::ErrorKind::NotFound),
                ));
            }
            image::open(&image).map_err(|source| YoloError::Image {
                path: image.clone(),
                source,
            })?;
            let boxes = read_labels(label_dir.as_ref().join(label.trim()), num_classes)?;

            samples.push(Sample { image, boxes });
        }

        log::info!("Loaded {} samples from {}", samples.len(), index.display());

        Ok(Self {
            samples,
            image_size,
            targets,
        })
    }

    /// Decodes the image at `index` and builds its targets.
    pub fn load(&self, index: usize) -> YoloResult<Option<YoloItem>> {
        let Some(sample) = self.samples.get(index) else {
            return Ok(None);
        };

        let image = load_image(&sample.image, self.image_size)?;

        Ok(Some(YoloItem::new(
            image,
            self.image_size,
            sample.boxes.clone(),
            &self.targets,
        )))
    }
}

impl Dataset<YoloItem> for YoloDataset {
    fn get(&self, index: usize) -> Option<YoloItem> {
        // The loader reads `None` as the end of the dataset.
        self.load(index)
            .unwrap_or_else(|err| panic!("Sample {index} can no longer be loaded: {err}"))
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// Parses a label file of `class x y width height` lines.
pub fn read_labels(path: impl AsRef<Path>, num_classes: usize) -> YoloResult<Vec<LabelBox>> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|err| YoloError::io(path, err))?;

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(line, text)| {
            parse_label(text, num_classes).map_err(|msg| YoloError::Label {
                path: path.to_path_buf(),
                line: line + 1,
                msg,
            })
        })
        .collect()
}

fn parse_label(line: &str, num_classes: usize) -> Result<LabelBox, String> {
    let values = line
        .split_whitespace()
        .map(|value| value.parse::<f32>().map_err(|err| format!("{value:?}: {err}")))
        .collect::<Result<Vec<_>, _>>()?;

    let [class, x, y, width, height] = values[..] else {
        return Err(format!("expected 5 values, found {}", values.len()));
    };

    if class < 0.0 || class.fract() != 0.0 || class as usize >= num_classes {
        return Err(format!("class {class} is not in 0..{num_classes}"));
    }
    if ![x, y].iter().all(|value| (0.0..=1.0).contains(value)) {
        return Err(format!("center ({x}, {y}) is outside the image"));
    }
    if ![width, height]
        .iter()
        .all(|value| *value > 0.0 && *value <= 1.0)
    {
        return Err(format!("size ({width}, {height}) must be in (0, 1]"));
    }

    Ok(LabelBox {
        x,
        y,
        width,
        height,
        class: class as usize,
    })
}

/// Loads an image as RGB, resized to a square and scaled to `[0, 1]`, in CHW order.
pub fn load_image(path: impl AsRef<Path>, image_size: usize) -> YoloResult<Vec<f32>> {
    let path = path.as_ref();
    let image = image::open(path)
        .map_err(|source| YoloError::Image {
            path: path.to_path_buf(),
            source,
        })?
        .resize_exact(image_size as u32, image_size as u32, FilterType::Triangle)
        .to_rgb8();

    let plane = image_size * image_size;
    let mut pixels = vec![0.0; 3 * plane];
    for (index, pixel) in image.pixels().enumerate() {
        for (channel, value) in pixel.0.iter().enumerate() {
            pixels[channel * plane + index] = *value as f32 / 255.0;
        }
    }

    Ok(pixels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{anchors::default_anchors, TestBackend};
    use burn::data::{dataloader::DataLoaderBuilder, dataset::InMemDataset};

    fn builder() -> TargetBuilder {
        TargetBuilder::new(&default_anchors(), &[1, 2, 4])
    }

    fn write_sample(dir: &Path, name: &str, labels: &str) {
        image::RgbImage::from_fn(8, 6, |x, _| image::Rgb([255, (x * 30) as u8, 0]))
            .save(dir.join(format!("{name}.png")))
            .unwrap();
        fs::write(dir.join(format!("{name}.txt")), labels).unwrap();
    }

    #[test]
    fn labels_are_parsed_and_validated() {
        assert_eq!(
            parse_label("3 0.5 0.25 0.1 0.2", 20).unwrap(),
            LabelBox {
                x: 0.5,
                y: 0.25,
                width: 0.1,
                height: 0.2,
                class: 3
            }
        );
        assert!(parse_label("20 0.5 0.5 0.1 0.1", 20).is_err());
        assert!(parse_label("1.5 0.5 0.5 0.1 0.1", 20).is_err());
        assert!(parse_label("1 1.5 0.5 0.1 0.1", 20).is_err());
        assert!(parse_label("1 0.5 0.5 0.0 0.1", 20).is_err());
        assert!(parse_label("1 0.5 0.5 0.1", 20).is_err());
        assert!(parse_label("a 0.5 0.5 0.1 0.1", 20).is_err());
    }

    #[test]
    fn reads_an_index_and_decodes_lazily() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), "a", "0 0.5 0.5 0.4 0.4\n\n1 0.2 0.2 0.1 0.1\n");
        write_sample(dir.path(), "b", "");
        let index = dir.path().join("index.csv");
        fs::write(&index, "image,label\na.png,a.txt\nb.png,b.txt\n").unwrap();

        let dataset =
            YoloDataset::from_csv(&index, dir.path(), dir.path(), 4, 2, builder()).unwrap();

        assert_eq!(dataset.len(), 2);
        let item = dataset.get(0).unwrap();
        assert_eq!(item.boxes.len(), 2);
        assert_eq!(item.image.len(), 3 * 4 * 4);
        assert!(item.image.iter().all(|value| (0.0..=1.0).contains(value)));
        // Red channel is saturated everywhere, blue is empty.
        assert!(item.image[..16].iter().all(|value| *value == 1.0));
        assert!(item.image[32..].iter().all(|value| *value == 0.0));
        assert_eq!(item.targets.len(), 3);
        assert!(dataset.get(1).unwrap().boxes.is_empty());
        assert!(dataset.get(2).is_none());
    }

    #[test]
    fn invalid_labels_fail_at_load_time() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), "a", "0 0.5 0.5 0.4 0.4\n7 0.5 0.5 0.4 0.4\n");
        let index = dir.path().join("index.csv");
        fs::write(&index, "image,label\na.png,a.txt\n").unwrap();

        let err = YoloDataset::from_csv(&index, dir.path(), dir.path(), 4, 2, builder())
            .unwrap_err();

        assert!(matches!(err, YoloError::Label { line: 2, .. }));
    }

    #[test]
    fn missing_images_fail_at_load_time() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "").unwrap();
        let index = dir.path().join("index.csv");
        fs::write(&index, "image,label\nmissing.png,a.txt\n").unwrap();

        let err = YoloDataset::from_csv(&index, dir.path(), dir.path(), 4, 2, builder())
            .unwrap_err();

        assert!(matches!(err, YoloError::Io { .. }));
    }

    #[test]
    fn corrupt_images_fail_at_load_time() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), "a", "0 0.5 0.5 0.4 0.4\n");
        write_sample(dir.path(), "c", "1 0.5 0.5 0.4 0.4\n");
        fs::write(dir.path().join("b.png"), b"not an image").unwrap();
        fs::write(dir.path().join("b.txt"), "").unwrap();
        let index = dir.path().join("index.csv");
        fs::write(&index, "image,label\na.png,a.txt\nb.png,b.txt\nc.png,c.txt\n").unwrap();

        let err = YoloDataset::from_csv(&index, dir.path(), dir.path(), 4, 2, builder())
            .unwrap_err();

        match err {
            YoloError::Image { path, .. } => assert!(path.ends_with("b.png")),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn loader_yields_every_sample() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a", "b", "c"] {
            write_sample(dir.path(), name, "0 0.5 0.5 0.4 0.4\n");
        }
        let index = dir.path().join("index.csv");
        fs::write(&index, "image,label\na.png,a.txt\nb.png,b.txt\nc.png,c.txt\n").unwrap();
        let dataset =
            YoloDataset::from_csv(&index, dir.path(), dir.path(), 4, 2, builder()).unwrap();

        let loader = DataLoaderBuilder::new(YoloBatcher::<TestBackend>::new(Default::default()))
            .batch_size(1)
            .num_workers(1)
            .build(dataset);

        assert_eq!(loader.iter().count(), 3);
    }

    #[test]
    fn batcher_stacks_images_and_targets() {
        let device = Default::default();
        let label = LabelBox {
            x: 0.5,
            y: 0.5,
            width: 0.3,
            height: 0.3,
            class: 1,
        };
        let items: Vec<_> = (0..2)
            .map(|_| YoloItem::new(vec![0.5; 3 * 4 * 4], 4, vec![label], &builder()))
            .collect();
        let dataset = InMemDataset::new(items);

        let batch = YoloBatcher::<TestBackend>::new(device)
            .batch(vec![dataset.get(0).unwrap(), dataset.get(1).unwrap()]);

        assert_eq!(batch.images.dims(), [2, 3, 4, 4]);
        let dims: Vec<_> = batch.targets.iter().map(|target| target.dims()).collect();
        assert_eq!(dims, vec![[2, 3, 1, 1, 6], [2, 3, 2, 2, 6], [2, 3, 4, 4, 6]]);
        let objects = batch.targets[0]
            .clone()
            .narrow(4, 0, 1)
            .equal_elem(1.0)
            .int()
            .sum()
            .into_scalar();
        assert_eq!(objects, 2);
    }
}
