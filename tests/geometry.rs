use geo::Coord;
use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage};
use ndarray::Array2;
use rapidocr_geometry::{
    contour::find_contours,
    crop::get_rotate_crop_image,
    dbnet::find_text_boxes,
    geometry::{graham_scan, mini_box, minimum_area_rectangle, signed_area, unclip},
    util::ScaleParam,
    OcrError,
};

fn rect_area(points: &[Coord<f32>]) -> f32 {
    signed_area(points).abs()
}

#[test]
fn hull_and_rectangle_reject_empty_input() {
    assert!(matches!(graham_scan(&[]), Err(OcrError::InvalidInput(_))));
    assert!(matches!(
        minimum_area_rectangle(&[]),
        Err(OcrError::InvalidInput(_))
    ));
}

#[test]
fn rectangle_area_is_bounded_by_the_bounding_box() {
    let points = [
        (3, 1),
        (10, 4),
        (14, 12),
        (6, 15),
        (1, 9),
        (7, 7),
        (9, 10),
    ]
    .map(|(x, y)| Coord { x, y });

    let rect = minimum_area_rectangle(&points).unwrap();
    assert_eq!(rect.len(), 4);

    let hull = graham_scan(&points)
        .unwrap()
        .into_iter()
        .map(|p| Coord {
            x: p.x as f32,
            y: p.y as f32,
        })
        .collect::<Vec<_>>();
    let bbox_area = 13.0 * 14.0;
    let area = rect_area(&rect);
    assert!(area >= rect_area(&hull) - 1e-2, "{area}");
    assert!(area <= bbox_area + 1e-2, "{area}");
}

#[test]
fn unclipped_box_is_never_smaller() {
    let cases = [
        [(10.0, 10.0), (60.0, 10.0), (60.0, 30.0), (10.0, 30.0)],
        [(20.0, 5.0), (80.0, 25.0), (74.0, 43.0), (14.0, 23.0)],
    ];
    for corners in cases {
        let corners = corners.map(|(x, y)| Coord { x, y });
        for ratio in [0.5, 1.0, 1.6, 2.5] {
            let grown = unclip(&corners, ratio).expect("box should unclip");
            let grown = mini_box(&grown).unwrap();
            assert!(
                rect_area(&grown.points) >= rect_area(&corners),
                "ratio {ratio} shrank {corners:?}"
            );
        }
    }
}

#[test]
fn mask_components_become_hulls() {
    let mask = GrayImage::from_fn(80, 40, |x, y| {
        if (5..=50).contains(&x) && (10..=20).contains(&y) || (60..=70).contains(&x) && y >= 25 {
            Luma([255])
        } else {
            Luma([0])
        }
    });
    let contours = find_contours(&mask);
    assert_eq!(contours.len(), 2);
    for contour in &contours {
        let rect = mini_box(contour).unwrap();
        assert!(rect.min_side >= 9.9, "{rect:?}");
    }
}

#[test]
fn white_image_has_no_text() {
    // A blank page gives a zero probability map.
    let pred = Array2::<f32>::zeros((50, 100));
    let scale = ScaleParam::new(100, 50, 100);
    assert!(find_text_boxes(pred.view(), scale, 0.5, 0.3, 1.6).is_empty());
}

#[test]
fn detected_box_crops_to_its_text() {
    let pred = Array2::from_shape_fn((64, 96), |(y, x)| {
        if (5..=50).contains(&x) && (10..=20).contains(&y) {
            0.95
        } else {
            0.0
        }
    });
    let scale = ScaleParam::new(96, 64, 96);
    let boxes = find_text_boxes(pred.view(), scale, 0.5, 0.3, 1.6);
    assert_eq!(boxes.len(), 1);

    let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(96, 64, Rgb([0, 0, 0])));
    let part = get_rotate_crop_image(&image, &boxes[0].points, Some(1.5)).unwrap();
    // Wider than the blob after unclipping, still a horizontal line.
    assert!(part.width() >= 45 && part.width() <= 96, "{}", part.width());
    assert!(part.height() >= 10 && part.height() < part.width());
}
