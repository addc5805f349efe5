use anyhow::Result;
use fingermatch_vision::{
    fingerprint, CnnEncoder, CnnWeights, Embedding, ExtractError, Extractor, EMBEDDING_DIM,
};
use image::{DynamicImage, GrayImage, Luma};

fn extractor(seed: u64) -> Result<Extractor> {
    let encoder = CnnEncoder::new(CnnWeights::seeded([4, 8, 16], seed))?;
    Ok(Extractor::new(Box::new(encoder))?)
}

/// Synthetic ridge pattern: concentric bands around an off-center core.
fn ridges(width: u32, height: u32, phase: f32) -> DynamicImage {
    DynamicImage::ImageLuma8(GrayImage::from_fn(width, height, |x, y| {
        let dx = x as f32 - width as f32 * 0.4;
        let dy = y as f32 - height as f32 * 0.55;
        let r = (dx * dx + dy * dy).sqrt();
        Luma([(127.5 + 127.5 * (r * 0.35 + phase).sin()) as u8])
    }))
}

#[test]
fn extraction_is_bit_identical() -> Result<()> {
    env_logger::try_init().ok();
    let extractor = extractor(11)?;
    let img = ridges(200, 240, 0.0);

    let a = extractor.extract_image(&img)?;
    let b = extractor.extract_image(&img.clone())?;
    assert_eq!(a.as_slice(), b.as_slice());

    // A separately constructed extractor with the same weights agrees too.
    let c = self::extractor(11)?.extract_image(&img)?;
    assert_eq!(a.as_slice(), c.as_slice());
    Ok(())
}

#[test]
fn embeddings_have_unit_norm() -> Result<()> {
    let extractor = extractor(5)?;
    for (i, img) in [
        ridges(128, 128, 0.0),
        ridges(500, 300, 1.3),
        ridges(64, 96, 2.1),
        DynamicImage::new_rgb8(40, 40),
    ]
    .iter()
    .enumerate()
    {
        let e = extractor.extract_image(img)?;
        assert_eq!(e.dim(), EMBEDDING_DIM);
        assert!((e.norm() - 1.0).abs() < 1e-5, "image {i}: norm {}", e.norm());
    }
    Ok(())
}

#[test]
fn one_pixel_change_moves_the_embedding() -> Result<()> {
    let extractor = extractor(3)?;
    let base = GrayImage::from_pixel(128, 128, Luma([128]));
    let mut perturbed = base.clone();
    perturbed.put_pixel(64, 64, Luma([255]));

    let a = extractor.extract_image(&DynamicImage::ImageLuma8(base))?;
    let b = extractor.extract_image(&DynamicImage::ImageLuma8(perturbed))?;

    let sim = fingerprint::match_embedding(a.as_slice(), b.as_slice());
    assert!(sim < 1.0, "similarity {sim}");
    assert!(sim > 0.9, "similarity {sim}");
    Ok(())
}

#[test]
fn different_prints_differ() -> Result<()> {
    let extractor = extractor(9)?;
    let a = extractor.extract_image(&ridges(160, 160, 0.0))?;
    let b = extractor.extract_image(&ridges(160, 160, 1.5))?;
    assert_ne!(a, b);
    Ok(())
}

#[test]
fn extract_from_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("probe.png");
    let img = ridges(150, 180, 0.4);
    img.save(&path)?;

    let extractor = extractor(21)?;
    let from_file = extractor.extract_path(&path)?;
    let in_memory = extractor.extract_image(&img)?;
    assert_eq!(from_file.as_slice(), in_memory.as_slice());

    // Format is sniffed from content, not the extension.
    let renamed = dir.path().join("probe.dat");
    std::fs::copy(&path, &renamed)?;
    assert_eq!(extractor.extract_path(&renamed)?, from_file);
    Ok(())
}

#[test]
fn missing_and_corrupt_inputs() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let extractor = extractor(1)?;

    let missing = dir.path().join("nope.png");
    assert!(matches!(
        extractor.extract_path(&missing),
        Err(ExtractError::InputNotFound)
    ));

    let corrupt = dir.path().join("corrupt.png");
    std::fs::write(&corrupt, b"\x89PNG\r\n\x1a\nthis is not a png")?;
    let err = extractor.extract_path(&corrupt).unwrap_err();
    assert!(matches!(err, ExtractError::InputUnreadable(_)));
    assert!(!err.to_string().contains("corrupt.png"));

    let text = dir.path().join("notes.txt");
    std::fs::write(&text, "plain text")?;
    assert!(matches!(
        extractor.extract_path(&text),
        Err(ExtractError::InputUnreadable(_))
    ));
    Ok(())
}

#[test]
fn weights_roundtrip_through_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("cnn.bin");
    let weights = CnnWeights::seeded([4, 8, 16], 42);
    weights.save(&path)?;

    let loaded = CnnEncoder::load(&path)?;
    assert_eq!(loaded.weights(), &weights);

    let img = ridges(128, 128, 0.7);
    let a: Embedding = Extractor::new(Box::new(loaded))?.extract_image(&img)?;
    let b = extractor(42)?.extract_image(&img)?;
    assert_eq!(a, b);

    std::fs::write(&path, [0u8; 3])?;
    assert!(matches!(
        CnnEncoder::load(&path),
        Err(ExtractError::ModelLoad(_))
    ));
    Ok(())
}

#[test]
fn concurrent_extraction() -> Result<()> {
    let extractor = extractor(13)?;
    let img = ridges(128, 128, 0.2);
    let expected = extractor.extract_image(&img)?;

    std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| s.spawn(|| extractor.extract_image(&img)))
            .collect();
        for h in handles {
            let e = h.join().expect("worker panicked").expect("extraction failed");
            assert_eq!(e, expected);
        }
    });
    Ok(())
}
